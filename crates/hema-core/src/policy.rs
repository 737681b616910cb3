//! 风险判定策略
//!
//! 阈值表与并列容差是配置数据，在构造风险解释器时传入，
//! 同时作为快照随报告持久化，以便审计时重放。

use crate::error::{HemaError, Result};
use crate::models::{ClassSpec, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 概率阈值表：概率达到某个下限即进入对应等级
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTable {
    pub moderate: f32,
    pub high: f32,
    pub critical: f32,
}

impl ThresholdTable {
    pub fn new(moderate: f32, high: f32, critical: f32) -> Result<Self> {
        let table = Self {
            moderate,
            high,
            critical,
        };
        table.validate()?;
        Ok(table)
    }

    /// 下限必须严格递增且位于 (0, 1]
    pub fn validate(&self) -> Result<()> {
        let cutoffs = [self.moderate, self.high, self.critical];
        if cutoffs.iter().any(|c| !c.is_finite() || *c <= 0.0 || *c > 1.0) {
            return Err(HemaError::Config(format!(
                "risk thresholds must lie in (0, 1]: {:?}",
                cutoffs
            )));
        }
        if !(self.moderate < self.high && self.high < self.critical) {
            return Err(HemaError::Config(format!(
                "risk thresholds must be strictly ascending: {:?}",
                cutoffs
            )));
        }
        Ok(())
    }

    /// 将单个概率映射到风险等级
    pub fn level_for(&self, probability: f32) -> RiskLevel {
        if probability >= self.critical {
            RiskLevel::Critical
        } else if probability >= self.high {
            RiskLevel::High
        } else if probability >= self.moderate {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            moderate: 0.4,
            high: 0.7,
            critical: 0.9,
        }
    }
}

/// 完整的风险判定策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPolicy {
    pub thresholds: ThresholdTable,
    /// 两个类别概率差小于该值时视为并列，按更高风险处理
    pub tie_epsilon: f32,
    /// 非最高类别的恶性类别概率达到该值时，至少判定为 MODERATE
    pub secondary_alert: Option<f32>,
    pub classes: Vec<ClassSpec>,
}

impl RiskPolicy {
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;

        if !self.tie_epsilon.is_finite() || self.tie_epsilon < 0.0 || self.tie_epsilon >= 1.0 {
            return Err(HemaError::Config(format!(
                "tie epsilon must lie in [0, 1): {}",
                self.tie_epsilon
            )));
        }

        if let Some(alert) = self.secondary_alert {
            if !alert.is_finite() || alert <= 0.0 || alert > 1.0 {
                return Err(HemaError::Config(format!(
                    "secondary alert threshold must lie in (0, 1]: {}",
                    alert
                )));
            }
        }

        if self.classes.is_empty() {
            return Err(HemaError::Config("class table must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for class in &self.classes {
            if !seen.insert(class.label.as_str()) {
                return Err(HemaError::Config(format!(
                    "duplicate class label: {}",
                    class.label
                )));
            }
        }

        Ok(())
    }

    pub fn labels(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.label.clone()).collect()
    }

    pub fn class(&self, label: &str) -> Option<&ClassSpec> {
        self.classes.iter().find(|c| c.label == label)
    }
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            thresholds: ThresholdTable::default(),
            tie_epsilon: 0.05,
            secondary_alert: Some(0.20),
            classes: ClassSpec::blood_cell_classes(),
        }
    }
}
