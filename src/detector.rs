use std::collections::BTreeSet;

use rustc_hash::FxHashSet;

use crate::histogram::{percentile_sorted, Histogram};
use crate::profile::{AppProfile, AppProfileAttribute, ProfileView};
use crate::risk::RiskLevel;
use crate::summary::{AppSummary, ANOMALY_MESSAGE};

/// Numeric attributes scored by the fence/histogram technique, in
/// evaluation order.
const NUMERIC_ATTRIBUTES: [AppProfileAttribute; 5] = [
    AppProfileAttribute::MemoryRss,
    AppProfileAttribute::CpuPercent,
    AppProfileAttribute::ChildrenCount,
    AppProfileAttribute::ThreadsNumber,
    AppProfileAttribute::ConnectionsNumber,
];

/// Scores an application's latest sample batch against its own history.
///
/// Numeric attributes are compared to Tukey fences over the historical
/// values, with two softening adjustments: a point closer to the fence
/// than to the recorded extreme drops one level, and a point falling in a
/// well-populated histogram bin drops one level (but never below `Low`).
/// Non-numeric attributes use whitelist deviation (usernames, open files)
/// and blacklist intersection (open files).
pub struct FrequencyDetector {
    min_history: usize,
    min_bin_support: u64,
    prohibited_files: FxHashSet<String>,
}

impl FrequencyDetector {
    pub fn new(
        min_history: usize,
        min_bin_support: u64,
        prohibited_files: impl IntoIterator<Item = String>,
    ) -> FrequencyDetector {
        FrequencyDetector {
            min_history,
            min_bin_support,
            prohibited_files: prohibited_files.into_iter().collect(),
        }
    }

    /// Runs every check over one profile. Always returns a summary; a
    /// profile with too little history or an empty latest batch scores
    /// `RiskLevel::None` rather than erroring.
    pub fn detect(&self, profile: &AppProfile) -> AppSummary {
        let historical = profile.historical_view();
        let latest = profile.latest_view();

        let mut risk = RiskLevel::None;
        let mut abnormal_attributes = BTreeSet::new();

        for attribute in NUMERIC_ATTRIBUTES {
            let historical_values = historical
                .numeric_values(attribute)
                .unwrap_or_default();
            let latest_values = latest.numeric_values(attribute).unwrap_or_default();
            if let Some(level) = self.score_numeric(&historical_values, &latest_values) {
                abnormal_attributes.insert(attribute);
                risk = risk.max(level);
            }
        }

        if let Some(level) = self.score_usernames(&historical, &latest) {
            abnormal_attributes.insert(AppProfileAttribute::Usernames);
            risk = risk.max(level);
        }
        if let Some(level) = self.score_open_files(&historical, &latest) {
            abnormal_attributes.insert(AppProfileAttribute::OpenedFiles);
            risk = risk.max(level);
        }

        let error_message = if abnormal_attributes.is_empty() {
            None
        } else {
            Some(ANOMALY_MESSAGE.to_string())
        };

        AppSummary {
            app_name: profile.name().to_string(),
            error_message,
            risk,
            abnormal_attributes,
            latest_snapshot: latest.to_snapshot(),
            model_snapshot: historical.to_snapshot(),
        }
    }

    /// The first out-of-fence point in the latest batch decides the
    /// attribute's risk; in-fence points contribute nothing.
    fn score_numeric(&self, historical: &[f64], latest: &[f64]) -> Option<RiskLevel> {
        if historical.is_empty() || historical.len() < self.min_history {
            return None;
        }
        let mut sorted = historical.to_vec();
        sorted.sort_by(f64::total_cmp);
        let q1 = percentile_sorted(&sorted, 25.0);
        let q3 = percentile_sorted(&sorted, 75.0);
        let iqr = q3 - q1;
        let lower_fence = q1 - 1.5 * iqr;
        let upper_fence = q3 + 1.5 * iqr;
        let lowest = sorted[0];
        let highest = sorted[sorted.len() - 1];
        let histogram = Histogram::freedman_diaconis(historical);

        for &point in latest {
            let bin_support = histogram.bin_count(point);
            if point < lower_fence {
                let mut level = RiskLevel::Medium;
                let distance_to_lowest = point - lowest;
                let distance_to_fence = lower_fence - point;
                // A negative distance_to_lowest means the point undercuts
                // every recorded value; no softening then.
                if lower_fence > lowest
                    && distance_to_lowest > 0.0
                    && distance_to_fence < distance_to_lowest
                {
                    level = level.saturating_lower(1);
                }
                if bin_support > self.min_bin_support && level > RiskLevel::Low {
                    level = level.saturating_lower(1);
                }
                return Some(level);
            }
            if point > upper_fence {
                let mut level = RiskLevel::High;
                let distance_to_highest = highest - point;
                let distance_to_fence = point - upper_fence;
                if upper_fence < highest
                    && distance_to_highest > 0.0
                    && distance_to_fence < distance_to_highest
                {
                    level = level.saturating_lower(1);
                }
                if bin_support > self.min_bin_support && level > RiskLevel::Low {
                    level = level.saturating_lower(1);
                }
                return Some(level);
            }
        }
        None
    }

    /// Whitelist check: any username in the latest batch that history has
    /// never seen.
    fn score_usernames(
        &self,
        historical: &ProfileView<'_>,
        latest: &ProfileView<'_>,
    ) -> Option<RiskLevel> {
        if historical.len() < self.min_history {
            return None;
        }
        let known: FxHashSet<&str> = historical
            .usernames
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        let unseen = latest
            .usernames
            .iter()
            .flatten()
            .any(|user| !known.contains(user.as_str()));
        unseen.then_some(RiskLevel::Medium)
    }

    /// Open files combine a whitelist check (any path history has never
    /// seen) with a blacklist check (a prohibited path touched for the
    /// first time). A blacklisted path already present in history does not
    /// re-raise. The whitelist needs enough history; the blacklist always
    /// applies.
    fn score_open_files(
        &self,
        historical: &ProfileView<'_>,
        latest: &ProfileView<'_>,
    ) -> Option<RiskLevel> {
        let known: FxHashSet<&str> = historical
            .open_files
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        let touched: FxHashSet<&str> = latest
            .open_files
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();

        let mut level = RiskLevel::None;
        if historical.len() >= self.min_history
            && touched.iter().any(|path| !known.contains(path))
        {
            level = RiskLevel::Medium;
        }
        let newly_touched_prohibited = self
            .prohibited_files
            .iter()
            .any(|path| !known.contains(path.as_str()) && touched.contains(path.as_str()));
        if newly_touched_prohibited {
            level = RiskLevel::High;
        }
        (level != RiskLevel::None).then_some(level)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::profile::test_support::{profile_with_history, row, ts};
    use crate::profile::AppProfile;

    const BASELINE_RSS: [u64; 10] = [100, 110, 95, 105, 120, 98, 102, 107, 99, 101];

    fn detector() -> FrequencyDetector {
        FrequencyDetector::new(
            10,
            5,
            ["/etc/passwd", "/etc/shadow", "/etc/bashrc"]
                .into_iter()
                .map(String::from),
        )
    }

    #[test]
    fn common_case_memory_is_not_flagged() {
        let profile = profile_with_history(&BASELINE_RSS, &[108]);
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::None);
        assert!(summary.abnormal_attributes.is_empty());
        assert_eq!(summary.error_message, None);
    }

    #[test]
    fn very_high_memory_is_high_risk() {
        let profile = profile_with_history(&BASELINE_RSS, &[10000]);
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::High);
        assert!(summary
            .abnormal_attributes
            .contains(&AppProfileAttribute::MemoryRss));
        assert_eq!(summary.error_message.as_deref(), Some(ANOMALY_MESSAGE));
    }

    #[test]
    fn moderately_high_memory_within_recorded_range_is_medium_risk() {
        // The upper fence for the baseline sits at 117.375 with a recorded
        // maximum of 120; 118 crosses the fence but sits closer to it than
        // to the maximum, so the risk softens one level.
        let profile = profile_with_history(&BASELINE_RSS, &[118]);
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::Medium);
        assert!(summary
            .abnormal_attributes
            .contains(&AppProfileAttribute::MemoryRss));
    }

    #[test]
    fn high_memory_beyond_recorded_range_is_not_softened() {
        // 150 exceeds the recorded maximum, so the proximity adjustment
        // does not apply and the full high risk stands.
        let profile = profile_with_history(&BASELINE_RSS, &[150]);
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::High);
    }

    #[test]
    fn very_low_memory_is_medium_risk() {
        let profile = profile_with_history(&BASELINE_RSS, &[1]);
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::Medium);
        assert!(summary
            .abnormal_attributes
            .contains(&AppProfileAttribute::MemoryRss));
    }

    #[test]
    fn crowded_bin_softens_the_risk() {
        // History: ten identical values plus one extreme, so both fences
        // collapse onto 100 and the single histogram bin holds all eleven
        // points. A point near the extreme skips the proximity adjustment
        // but lands in the crowded bin: high drops to medium.
        let mut history = vec![100u64; 10];
        history.push(1000);
        let profile = profile_with_history(&history, &[990]);
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::Medium);
    }

    #[test]
    fn softening_never_drops_below_low() {
        // A point just past the collapsed fence is both close to the fence
        // and inside the crowded bin; the two adjustments stack to low and
        // stop there.
        let mut history = vec![100u64; 10];
        history.push(1000);
        let profile = profile_with_history(&history, &[150]);
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::Low);
    }

    #[test]
    fn short_history_scores_none() {
        let profile = profile_with_history(&[100, 110, 95], &[10000]);
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::None);
        assert!(summary.abnormal_attributes.is_empty());
    }

    #[test]
    fn unknown_username_is_medium_risk() {
        let mut profile = profile_with_history(&BASELINE_RSS, &[]);
        let mut intruder = row(103);
        intruder.usernames = vec!["mallory".to_string()];
        profile
            .append(intruder, ts("2021-01-31 21:00:00:000000"))
            .unwrap();
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::Medium);
        assert!(summary
            .abnormal_attributes
            .contains(&AppProfileAttribute::Usernames));
    }

    #[test]
    fn newly_touched_prohibited_file_is_high_risk() {
        let mut profile = profile_with_history(&BASELINE_RSS, &[]);
        let mut intruder = row(103);
        intruder.open_files = vec!["/etc/shadow".to_string()];
        profile
            .append(intruder, ts("2021-01-31 21:00:00:000000"))
            .unwrap();
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::High);
        assert!(summary
            .abnormal_attributes
            .contains(&AppProfileAttribute::OpenedFiles));
    }

    #[test]
    fn prohibited_file_applies_even_with_short_history() {
        let mut profile = AppProfile::new("nc".to_string());
        profile.append(row(100), ts("2021-01-31 20:00:00:000000")).unwrap();
        let mut intruder = row(101);
        intruder.open_files = vec!["/etc/passwd".to_string()];
        profile
            .append(intruder, ts("2021-01-31 21:00:00:000000"))
            .unwrap();
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::High);
        assert!(summary
            .abnormal_attributes
            .contains(&AppProfileAttribute::OpenedFiles));
    }

    #[test]
    fn prohibited_file_already_in_history_does_not_re_raise() {
        let mut profile = AppProfile::new("login".to_string());
        for i in 0..10u64 {
            let mut historical = row(100 + i);
            historical.open_files = vec!["/etc/passwd".to_string()];
            profile
                .append(historical, ts(&format!("2021-01-31 20:{:02}:00:000000", i)))
                .unwrap();
        }
        let mut latest = row(105);
        latest.open_files = vec!["/etc/passwd".to_string()];
        profile
            .append(latest, ts("2021-01-31 21:00:00:000000"))
            .unwrap();
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::None);
    }

    #[test]
    fn new_ordinary_file_is_medium_risk() {
        let mut profile = profile_with_history(&BASELINE_RSS, &[]);
        let mut latest = row(103);
        latest.open_files = vec!["/home/alice/.bash_history".to_string()];
        profile
            .append(latest, ts("2021-01-31 21:00:00:000000"))
            .unwrap();
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::Medium);
        assert!(summary
            .abnormal_attributes
            .contains(&AppProfileAttribute::OpenedFiles));
    }

    #[test]
    fn risk_aggregates_to_the_maximum_over_attributes() {
        // An unknown user (medium) together with a fresh prohibited file
        // (high) flags both attributes at the higher level.
        let mut profile = profile_with_history(&BASELINE_RSS, &[]);
        let mut intruder = row(103);
        intruder.usernames = vec!["mallory".to_string()];
        intruder.open_files = vec!["/etc/shadow".to_string()];
        profile
            .append(intruder, ts("2021-01-31 21:00:00:000000"))
            .unwrap();
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::High);
        assert!(summary
            .abnormal_attributes
            .contains(&AppProfileAttribute::Usernames));
        assert!(summary
            .abnormal_attributes
            .contains(&AppProfileAttribute::OpenedFiles));
    }

    #[test]
    fn summary_fields_agree_on_anomaly_presence() {
        for profile in [
            profile_with_history(&BASELINE_RSS, &[108]),
            profile_with_history(&BASELINE_RSS, &[10000]),
        ] {
            let summary = detector().detect(&profile);
            let flagged = !summary.abnormal_attributes.is_empty();
            assert_eq!(summary.is_anomalous(), flagged);
            assert_eq!(summary.error_message.is_some(), flagged);
        }
    }

    #[test]
    fn detection_is_idempotent() {
        let profile = profile_with_history(&BASELINE_RSS, &[10000]);
        let detector = detector();
        assert_eq!(detector.detect(&profile), detector.detect(&profile));
    }

    #[test]
    fn empty_latest_batch_scores_none() {
        let mut profile = AppProfile::new("idle".to_string());
        for i in 0..12u64 {
            profile
                .append(row(100), ts(&format!("2021-01-31 20:{:02}:00:000000", i)))
                .unwrap();
        }
        // Every row shares no duplicate timestamp, so the "latest batch"
        // is the single newest row and everything else is history; with an
        // unremarkable newest row nothing fires.
        let summary = detector().detect(&profile);
        assert_eq!(summary.risk, RiskLevel::None);

        let empty = AppProfile::new("ghost".to_string());
        let summary = detector().detect(&empty);
        assert_eq!(summary.risk, RiskLevel::None);
        assert!(summary.latest_snapshot.retrieval_timestamps.is_empty());
    }
}
