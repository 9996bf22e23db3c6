use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Severity attached to a detected anomaly. Totally ordered:
/// `None < Low < Medium < High`.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

const LEVELS: [RiskLevel; 4] = [
    RiskLevel::None,
    RiskLevel::Low,
    RiskLevel::Medium,
    RiskLevel::High,
];

impl RiskLevel {
    /// Raises by `steps`, clamping at `High`.
    pub fn saturating_raise(self, steps: usize) -> RiskLevel {
        LEVELS[(self as usize + steps).min(LEVELS.len() - 1)]
    }

    /// Lowers by `steps`, clamping at `None`.
    pub fn saturating_lower(self, steps: usize) -> RiskLevel {
        LEVELS[(self as usize).saturating_sub(steps)]
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        f.write_str(name)
    }
}
