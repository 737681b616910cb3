//! 风险解释器

use hema_core::{HemaError, InferenceResult, Result, RiskAssessment, RiskLevel, RiskPolicy};
use tracing::trace;

/// 风险解释器
///
/// 阈值表在构造时传入，调用过程中不读取任何外部配置。
#[derive(Debug, Clone)]
pub struct RiskInterpreter {
    policy: RiskPolicy,
}

impl RiskInterpreter {
    pub fn new(policy: RiskPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    /// 单个类别按自身概率得到的风险等级
    ///
    /// 恶性类别按阈值表映射，良性类别恒为 LOW。
    pub fn class_level(&self, label: &str, probability: f32) -> Result<RiskLevel> {
        let class = self
            .policy
            .class(label)
            .ok_or_else(|| HemaError::Config(format!("class {} is not in the risk policy", label)))?;

        Ok(if class.malignant {
            self.policy.thresholds.level_for(probability)
        } else {
            RiskLevel::Low
        })
    }

    /// 由推理结果计算风险评估
    pub fn assess(&self, inference: &InferenceResult) -> Result<RiskAssessment> {
        let probabilities = inference.probabilities();
        let labels = inference.labels();
        let top = inference.top_class();
        let top_probability = inference.top_probability();
        let epsilon = self.policy.tie_epsilon;

        let levels = labels
            .iter()
            .zip(probabilities)
            .map(|(label, p)| self.class_level(label, *p))
            .collect::<Result<Vec<_>>>()?;

        let base = levels[top];
        let mut level = base;
        let mut findings = vec![
            format!(
                "Predicted class: {} ({:.1}%)",
                labels[top],
                top_probability * 100.0
            ),
            format!("Cell distribution: {}", distribution(inference)),
        ];

        // 与最高类别差距小于 epsilon 的类别视为并列，取其中最高风险
        let contenders: Vec<usize> = (0..probabilities.len())
            .filter(|&i| i == top || top_probability - probabilities[i] < epsilon)
            .collect();

        for &i in contenders.iter().filter(|&&i| i != top) {
            if levels[i] > level {
                findings.push(format!(
                    "Near-tie between {} ({:.1}%) and {} ({:.1}%) within {:.1} points; risk escalated from {} to {}",
                    labels[top],
                    top_probability * 100.0,
                    labels[i],
                    probabilities[i] * 100.0,
                    epsilon * 100.0,
                    level,
                    levels[i]
                ));
                level = levels[i];
            }
        }

        if let Some(alert) = self.policy.secondary_alert {
            for (i, label) in labels.iter().enumerate() {
                if contenders.contains(&i) || probabilities[i] < alert {
                    continue;
                }
                let malignant = self.policy.class(label).map(|c| c.malignant).unwrap_or(false);
                if malignant {
                    findings.push(format!(
                        "Malignant class {} at {:.1}% exceeds the {:.1}% alert threshold",
                        label,
                        probabilities[i] * 100.0,
                        alert * 100.0
                    ));
                    if level < RiskLevel::Moderate {
                        findings.push(format!("Risk raised from {} to {}", level, RiskLevel::Moderate));
                        level = RiskLevel::Moderate;
                    }
                }
            }
        }

        findings.push(format!("{} Risk - {}", level, level.description()));

        trace!(
            inference_id = %inference.id(),
            base = %base,
            level = %level,
            "Risk assessed"
        );

        Ok(RiskAssessment {
            level,
            confidence: top_probability,
            top_class: labels[top].clone(),
            findings,
        })
    }

    /// 用当前策略重算并与已有评估比较
    pub fn verify(&self, inference: &InferenceResult, assessment: &RiskAssessment) -> Result<()> {
        let fresh = self.assess(inference)?;
        if &fresh != assessment {
            return Err(HemaError::Internal(format!(
                "stored assessment {} disagrees with recomputed {} for inference {}",
                assessment.level,
                fresh.level,
                inference.id()
            )));
        }
        Ok(())
    }
}

fn distribution(inference: &InferenceResult) -> String {
    inference
        .class_percentages()
        .iter()
        .map(|(label, pct)| format!("{} {:.1}%", label, pct))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hema_core::{ClassSpec, ModelVersion, ThresholdTable};

    fn binary_policy() -> RiskPolicy {
        RiskPolicy {
            thresholds: ThresholdTable::default(),
            tie_epsilon: 0.05,
            secondary_alert: Some(0.20),
            classes: vec![ClassSpec::malignant("cancerous"), ClassSpec::benign("benign")],
        }
    }

    fn inference(probabilities: Vec<f32>, labels: &[&str]) -> InferenceResult {
        InferenceResult::new(
            probabilities,
            labels.iter().map(|l| l.to_string()).collect(),
            ModelVersion::new("test", "ffff"),
        )
        .unwrap()
    }

    #[test]
    fn test_critical_scenario() {
        let interpreter = RiskInterpreter::new(binary_policy()).unwrap();
        let assessment = interpreter
            .assess(&inference(vec![0.92, 0.08], &["cancerous", "benign"]))
            .unwrap();

        assert_eq!(assessment.level, RiskLevel::Critical);
        assert_eq!(assessment.top_class, "cancerous");
        assert!((assessment.confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_moderate_scenario() {
        let interpreter = RiskInterpreter::new(binary_policy()).unwrap();
        let assessment = interpreter
            .assess(&inference(vec![0.55, 0.45], &["cancerous", "benign"]))
            .unwrap();
        assert_eq!(assessment.level, RiskLevel::Moderate);
    }

    #[test]
    fn test_benign_top_class_is_low() {
        let interpreter = RiskInterpreter::new(binary_policy()).unwrap();
        let assessment = interpreter
            .assess(&inference(vec![0.05, 0.95], &["cancerous", "benign"]))
            .unwrap();
        assert_eq!(assessment.level, RiskLevel::Low);
    }

    #[test]
    fn test_near_tie_escalates_to_higher_risk() {
        let interpreter = RiskInterpreter::new(binary_policy()).unwrap();
        // 良性类别略高，但恶性类别在容差内
        let assessment = interpreter
            .assess(&inference(vec![0.48, 0.52], &["cancerous", "benign"]))
            .unwrap();

        assert_eq!(assessment.top_class, "benign");
        assert_eq!(assessment.level, RiskLevel::Moderate);
        assert!(assessment.findings.iter().any(|f| f.starts_with("Near-tie")));
    }

    #[test]
    fn test_exact_tie_never_picks_lower() {
        let interpreter = RiskInterpreter::new(binary_policy()).unwrap();
        let assessment = interpreter
            .assess(&inference(vec![0.5, 0.5], &["benign", "cancerous"]))
            .unwrap();
        assert_eq!(assessment.top_class, "benign");
        assert_eq!(assessment.level, RiskLevel::Moderate);
    }

    #[test]
    fn test_tie_break_property_holds_across_distributions() {
        let interpreter = RiskInterpreter::new(binary_policy()).unwrap();
        let epsilon = interpreter.policy().tie_epsilon;

        for step in 0..=100 {
            let p = step as f32 / 100.0;
            for order in [["cancerous", "benign"], ["benign", "cancerous"]] {
                let result = inference(vec![p, 1.0 - p], &order);
                let assessment = interpreter.assess(&result).unwrap();

                let probs = result.probabilities();
                if (probs[0] - probs[1]).abs() < epsilon {
                    let higher = interpreter
                        .class_level(order[0], probs[0])
                        .unwrap()
                        .max(interpreter.class_level(order[1], probs[1]).unwrap());
                    assert!(assessment.level >= higher, "p={} order={:?}", p, order);
                }
            }
        }
    }

    #[test]
    fn test_secondary_malignant_alert() {
        let interpreter = RiskInterpreter::new(RiskPolicy::default()).unwrap();
        let labels = [
            "monocyte",
            "myeloblast",
            "erythroblast",
            "segmented_neutrophil",
            "basophil",
        ];
        let assessment = interpreter
            .assess(&inference(vec![0.60, 0.25, 0.05, 0.05, 0.05], &labels))
            .unwrap();

        assert_eq!(assessment.top_class, "monocyte");
        assert_eq!(assessment.level, RiskLevel::Moderate);
        assert!(assessment
            .findings
            .iter()
            .any(|f| f.contains("alert threshold")));
    }

    #[test]
    fn test_assessment_is_deterministic() {
        let interpreter = RiskInterpreter::new(RiskPolicy::default()).unwrap();
        let labels = [
            "monocyte",
            "myeloblast",
            "erythroblast",
            "segmented_neutrophil",
            "basophil",
        ];
        let result = inference(vec![0.1, 0.72, 0.08, 0.06, 0.04], &labels);

        let a = interpreter.assess(&result).unwrap();
        let b = interpreter.assess(&result).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.level, RiskLevel::High);
        assert!(interpreter.verify(&result, &a).is_ok());
    }

    #[test]
    fn test_verify_detects_tampered_level() {
        let interpreter = RiskInterpreter::new(binary_policy()).unwrap();
        let result = inference(vec![0.92, 0.08], &["cancerous", "benign"]);
        let mut assessment = interpreter.assess(&result).unwrap();
        assessment.level = RiskLevel::Low;

        assert!(matches!(
            interpreter.verify(&result, &assessment),
            Err(HemaError::Internal(_))
        ));
    }

    #[test]
    fn test_unknown_class_is_rejected() {
        let interpreter = RiskInterpreter::new(binary_policy()).unwrap();
        let result = inference(vec![0.6, 0.4], &["cancerous", "lymphocyte"]);
        assert!(matches!(interpreter.assess(&result), Err(HemaError::Config(_))));
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let mut policy = binary_policy();
        policy.thresholds.high = 0.95;
        assert!(RiskInterpreter::new(policy).is_err());
    }
}
