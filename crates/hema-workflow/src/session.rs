//! 诊断会话

use crate::state_machine::{SessionEvent, SessionState, SessionStateMachine};
use chrono::{DateTime, Utc};
use hema_core::{HemaError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 状态历史记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: SessionState,
    pub at: DateTime<Utc>,
}

/// 失败阶段与原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: SessionState,
    pub reason: String,
}

/// 一次诊断会话
///
/// 状态只能沿转换表前进；失败后通过 [`DiagnosticSession::restart`] 重新开始，历史保留。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticSession {
    id: Uuid,
    state: SessionState,
    attempt: u32,
    inference_attempts: u32,
    checksum: Option<String>,
    failure: Option<StageFailure>,
    history: Vec<StateRecord>,
}

impl DiagnosticSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Received,
            attempt: 1,
            inference_attempts: 0,
            checksum: None,
            failure: None,
            history: vec![StateRecord {
                state: SessionState::Received,
                at: Utc::now(),
            }],
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 第几次尝试，从 1 开始
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 本次尝试中调用模型的次数
    pub fn inference_attempts(&self) -> u32 {
        self.inference_attempts
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        self.failure.as_ref()
    }

    pub fn history(&self) -> &[StateRecord] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn bind_checksum(&mut self, checksum: &str) {
        self.checksum = Some(checksum.to_string());
    }

    pub(crate) fn record_inference_attempt(&mut self) {
        self.inference_attempts += 1;
    }

    /// 按事件推进状态
    pub fn advance(&mut self, event: SessionEvent) -> Result<SessionState> {
        let next = SessionStateMachine::shared().transition(self.state, event)?;
        self.enter(next);
        Ok(next)
    }

    /// 在当前阶段标记失败
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        let stage = self.state;
        self.advance(SessionEvent::Fail)?;
        self.failure = Some(StageFailure {
            stage,
            reason: reason.into(),
        });
        Ok(())
    }

    /// 从 FAILED 回到 RECEIVED
    pub fn restart(&mut self) -> Result<()> {
        if self.state != SessionState::Failed {
            return Err(HemaError::InvalidStateTransition {
                from: self.state.to_string(),
                event: format!("{:?}", SessionEvent::Restart),
            });
        }
        self.advance(SessionEvent::Restart)?;
        self.attempt += 1;
        self.inference_attempts = 0;
        self.failure = None;
        Ok(())
    }

    fn enter(&mut self, state: SessionState) {
        self.state = state;
        self.history.push(StateRecord {
            state,
            at: Utc::now(),
        });
    }
}

impl Default for DiagnosticSession {
    fn default() -> Self {
        Self::new()
    }
}
