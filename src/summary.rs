use std::collections::BTreeSet;

use serde_derive::{Deserialize, Serialize};

use crate::profile::{AppProfileAttribute, ProfileSnapshot};
use crate::risk::RiskLevel;
use crate::timestamp::Timestamp;

/// The fixed message attached to every anomalous summary.
pub const ANOMALY_MESSAGE: &str = "Anomalies found.";

/// The outcome of one detector run over one application profile.
///
/// `risk == RiskLevel::None` exactly when `abnormal_attributes` is empty,
/// exactly when `error_message` is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSummary {
    pub app_name: String,
    pub error_message: Option<String>,
    pub risk: RiskLevel,
    pub abnormal_attributes: BTreeSet<AppProfileAttribute>,
    /// The latest-batch rows the detector scored.
    pub latest_snapshot: ProfileSnapshot,
    /// The historical rows the detector modelled against.
    pub model_snapshot: ProfileSnapshot,
}

impl AppSummary {
    pub fn is_anomalous(&self) -> bool {
        self.risk != RiskLevel::None
    }

    /// The shared timestamp of the scored batch.
    pub fn latest_batch_timestamp(&self) -> Option<Timestamp> {
        self.latest_snapshot.retrieval_timestamps.last().copied()
    }

    pub fn brief(&self) -> SummaryBrief {
        SummaryBrief {
            app_name: self.app_name.clone(),
            risk: self.risk,
            error_message: self.error_message.clone(),
            abnormal_attributes: self.abnormal_attributes.iter().copied().collect(),
        }
    }
}

/// The wire form served to operators: everything needed at a glance,
/// without the row data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryBrief {
    pub app_name: String,
    pub risk: RiskLevel,
    pub error_message: Option<String>,
    pub abnormal_attributes: Vec<AppProfileAttribute>,
}
