//! 诊断会话状态机
//!
//! 管理一次诊断会话从接收到完成的状态转换

use hema_core::{HemaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Received,
    Preprocessing,
    Inferring,
    Interpreting,
    Compiling,
    Complete,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Received => "RECEIVED",
            SessionState::Preprocessing => "PREPROCESSING",
            SessionState::Inferring => "INFERRING",
            SessionState::Interpreting => "INTERPRETING",
            SessionState::Compiling => "COMPILING",
            SessionState::Complete => "COMPLETE",
            SessionState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Start,
    Preprocessed,
    Inferred,
    Interpreted,
    Compiled,
    /// 该样本已有报告
    AlreadyReported,
    Fail,
    Restart,
}

/// 会话状态机
#[derive(Debug)]
pub struct SessionStateMachine {
    transitions: HashMap<(SessionState, SessionEvent), SessionState>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        use SessionEvent::*;
        use SessionState::*;

        let mut transitions = HashMap::new();

        // 主流程
        transitions.insert((Received, Start), Preprocessing);
        transitions.insert((Preprocessing, Preprocessed), Inferring);
        transitions.insert((Inferring, Inferred), Interpreting);
        transitions.insert((Interpreting, Interpreted), Compiling);
        transitions.insert((Compiling, Compiled), Complete);

        // 重复样本直接完成
        transitions.insert((Received, AlreadyReported), Complete);
        transitions.insert((Compiling, AlreadyReported), Complete);

        for state in [Received, Preprocessing, Inferring, Interpreting, Compiling] {
            transitions.insert((state, Fail), Failed);
        }
        transitions.insert((Failed, Restart), Received);

        Self { transitions }
    }

    /// 进程内共享的转换表
    pub fn shared() -> &'static SessionStateMachine {
        static MACHINE: OnceLock<SessionStateMachine> = OnceLock::new();
        MACHINE.get_or_init(SessionStateMachine::new)
    }

    pub fn can_transition(&self, from: SessionState, event: SessionEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    pub fn transition(&self, from: SessionState, event: SessionEvent) -> Result<SessionState> {
        self.transitions
            .get(&(from, event))
            .copied()
            .ok_or_else(|| HemaError::InvalidStateTransition {
                from: from.to_string(),
                event: format!("{:?}", event),
            })
    }

    pub fn possible_events(&self, current: SessionState) -> Vec<SessionEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
