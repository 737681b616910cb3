//! 按风险等级给出的处理建议

use hema_core::RiskLevel;

const CRITICAL: &[&str] = &[
    "Urgent hematology referral within 24 hours",
    "Peripheral blood smear review by a hematopathologist",
    "Bone marrow aspiration and biopsy",
    "Flow cytometry immunophenotyping",
    "Monitor closely for fever, infection and bleeding",
];

const HIGH: &[&str] = &[
    "Schedule immediate hematologist consultation",
    "Complete blood count (CBC) test recommended",
    "Bone marrow biopsy may be necessary",
    "Follow-up within 24-48 hours",
    "Monitor for fever, fatigue, and unusual bleeding",
];

const MODERATE: &[&str] = &[
    "Schedule follow-up within one week",
    "Regular blood count monitoring",
    "Track any new symptoms",
    "Additional testing may be needed",
    "Maintain detailed symptom diary",
];

const LOW: &[&str] = &[
    "Continue regular check-ups as scheduled",
    "Monitor for any changes in symptoms",
    "Maintain regular blood test schedule",
    "Follow healthy lifestyle recommendations",
    "Report any new symptoms to healthcare provider",
];

pub fn recommendations_for(level: RiskLevel) -> Vec<String> {
    let list = match level {
        RiskLevel::Critical => CRITICAL,
        RiskLevel::High => HIGH,
        RiskLevel::Moderate => MODERATE,
        RiskLevel::Low => LOW,
    };
    list.iter().map(|s| s.to_string()).collect()
}
