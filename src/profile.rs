use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::timestamp::Timestamp;

/// Identity of a profile attribute, used to name flagged attributes in
/// summaries and in the anomaly log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AppProfileAttribute {
    MemoryRss,
    CpuPercent,
    ChildrenCount,
    ThreadsNumber,
    ConnectionsNumber,
    Usernames,
    OpenedFiles,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("sample timestamp {new} is older than the last recorded sample {last}")]
    NonMonotonicTimestamp { new: Timestamp, last: Timestamp },
    #[error("parallel vectors disagree on row count")]
    LengthMismatch,
}

/// One per-process measurement row, appended during a sample cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRow {
    pub memory_rss: u64,
    pub cpu_percent: f64,
    pub children_count: u64,
    pub threads_number: u64,
    pub connections_number: u64,
    /// Empty when the owning user could not be determined.
    pub usernames: Vec<String>,
    /// Deduplicated paths observed open in this process.
    pub open_files: Vec<String>,
}

/// The accumulated time-series for one application.
///
/// Rows are kept as parallel vectors, one entry per sampled process, all
/// sharing the length of `retrieval_timestamps`. Rows are append-only and
/// timestamps never decrease; every process discovered in one sample cycle
/// is appended with the same timestamp, which is what defines the "latest
/// batch" boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct AppProfile {
    name: String,
    created_at: Timestamp,
    memory_rss: Vec<u64>,
    cpu_percent: Vec<f64>,
    children_count: Vec<u64>,
    threads_number: Vec<u64>,
    connections_number: Vec<u64>,
    usernames: Vec<Vec<String>>,
    open_files_batches: Vec<Vec<String>>,
    retrieval_timestamps: Vec<Timestamp>,
}

/// Decoded storage parts, reassembled into a profile by
/// [`AppProfile::from_parts`].
pub struct ProfileParts {
    pub name: String,
    pub created_at: Timestamp,
    pub memory_rss: Vec<u64>,
    pub cpu_percent: Vec<f64>,
    pub children_count: Vec<u64>,
    pub threads_number: Vec<u64>,
    pub connections_number: Vec<u64>,
    pub usernames: Vec<Vec<String>>,
    pub open_files_batches: Vec<Vec<String>>,
    pub retrieval_timestamps: Vec<Timestamp>,
}

impl AppProfile {
    pub fn new(name: String) -> AppProfile {
        AppProfile {
            name,
            created_at: Timestamp::now(),
            memory_rss: Vec::new(),
            cpu_percent: Vec::new(),
            children_count: Vec::new(),
            threads_number: Vec::new(),
            connections_number: Vec::new(),
            usernames: Vec::new(),
            open_files_batches: Vec::new(),
            retrieval_timestamps: Vec::new(),
        }
    }

    /// Validates the parallel-vector and timestamp-ordering invariants
    /// before accepting decoded data.
    pub fn from_parts(parts: ProfileParts) -> Result<AppProfile, ProfileError> {
        let len = parts.retrieval_timestamps.len();
        if parts.memory_rss.len() != len
            || parts.cpu_percent.len() != len
            || parts.children_count.len() != len
            || parts.threads_number.len() != len
            || parts.connections_number.len() != len
            || parts.usernames.len() != len
            || parts.open_files_batches.len() != len
        {
            return Err(ProfileError::LengthMismatch);
        }
        for pair in parts.retrieval_timestamps.windows(2) {
            if pair[1] < pair[0] {
                return Err(ProfileError::NonMonotonicTimestamp {
                    new: pair[1],
                    last: pair[0],
                });
            }
        }
        Ok(AppProfile {
            name: parts.name,
            created_at: parts.created_at,
            memory_rss: parts.memory_rss,
            cpu_percent: parts.cpu_percent,
            children_count: parts.children_count,
            threads_number: parts.threads_number,
            connections_number: parts.connections_number,
            usernames: parts.usernames,
            open_files_batches: parts.open_files_batches,
            retrieval_timestamps: parts.retrieval_timestamps,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.retrieval_timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retrieval_timestamps.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.retrieval_timestamps.last().copied()
    }

    /// Appends one row. `timestamp` must not be older than the last
    /// recorded sample.
    pub fn append(&mut self, row: ProfileRow, timestamp: Timestamp) -> Result<(), ProfileError> {
        if let Some(last) = self.last_timestamp() {
            if timestamp < last {
                return Err(ProfileError::NonMonotonicTimestamp {
                    new: timestamp,
                    last,
                });
            }
        }
        self.memory_rss.push(row.memory_rss);
        self.cpu_percent.push(row.cpu_percent);
        self.children_count.push(row.children_count);
        self.threads_number.push(row.threads_number);
        self.connections_number.push(row.connections_number);
        self.usernames.push(row.usernames);
        self.open_files_batches.push(row.open_files);
        self.retrieval_timestamps.push(timestamp);
        Ok(())
    }

    /// Number of trailing rows whose timestamp equals the last timestamp.
    /// This is the batch boundary; it is derived from timestamp equality,
    /// never from a fixed window size.
    pub fn latest_batch_len(&self) -> usize {
        let Some(last) = self.retrieval_timestamps.last() else {
            return 0;
        };
        self.retrieval_timestamps
            .iter()
            .rev()
            .take_while(|ts| *ts == last)
            .count()
    }

    /// Rows strictly older than the latest batch.
    pub fn historical_view(&self) -> ProfileView<'_> {
        self.view(0, self.len() - self.latest_batch_len())
    }

    /// Rows belonging to the latest batch.
    pub fn latest_view(&self) -> ProfileView<'_> {
        self.view(self.len() - self.latest_batch_len(), self.len())
    }

    fn view(&self, start: usize, end: usize) -> ProfileView<'_> {
        ProfileView {
            memory_rss: &self.memory_rss[start..end],
            cpu_percent: &self.cpu_percent[start..end],
            children_count: &self.children_count[start..end],
            threads_number: &self.threads_number[start..end],
            connections_number: &self.connections_number[start..end],
            usernames: &self.usernames[start..end],
            open_files: &self.open_files_batches[start..end],
            retrieval_timestamps: &self.retrieval_timestamps[start..end],
        }
    }

    pub(crate) fn into_parts(self) -> ProfileParts {
        ProfileParts {
            name: self.name,
            created_at: self.created_at,
            memory_rss: self.memory_rss,
            cpu_percent: self.cpu_percent,
            children_count: self.children_count,
            threads_number: self.threads_number,
            connections_number: self.connections_number,
            usernames: self.usernames,
            open_files_batches: self.open_files_batches,
            retrieval_timestamps: self.retrieval_timestamps,
        }
    }
}

/// A borrowed run of profile rows: either the historical prefix or the
/// latest batch.
#[derive(Debug, Clone, Copy)]
pub struct ProfileView<'a> {
    pub memory_rss: &'a [u64],
    pub cpu_percent: &'a [f64],
    pub children_count: &'a [u64],
    pub threads_number: &'a [u64],
    pub connections_number: &'a [u64],
    pub usernames: &'a [Vec<String>],
    pub open_files: &'a [Vec<String>],
    pub retrieval_timestamps: &'a [Timestamp],
}

impl ProfileView<'_> {
    pub fn len(&self) -> usize {
        self.retrieval_timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retrieval_timestamps.is_empty()
    }

    /// The values of a numeric attribute as floats, or `None` for the
    /// non-numeric attributes.
    pub fn numeric_values(&self, attribute: AppProfileAttribute) -> Option<Vec<f64>> {
        let values = match attribute {
            AppProfileAttribute::MemoryRss => {
                self.memory_rss.iter().map(|&v| v as f64).collect()
            }
            AppProfileAttribute::CpuPercent => self.cpu_percent.to_vec(),
            AppProfileAttribute::ChildrenCount => {
                self.children_count.iter().map(|&v| v as f64).collect()
            }
            AppProfileAttribute::ThreadsNumber => {
                self.threads_number.iter().map(|&v| v as f64).collect()
            }
            AppProfileAttribute::ConnectionsNumber => {
                self.connections_number.iter().map(|&v| v as f64).collect()
            }
            AppProfileAttribute::Usernames | AppProfileAttribute::OpenedFiles => return None,
        };
        Some(values)
    }

    pub fn to_snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            memory_rss: self.memory_rss.to_vec(),
            cpu_percent: self.cpu_percent.to_vec(),
            children_count: self.children_count.to_vec(),
            threads_number: self.threads_number.to_vec(),
            connections_number: self.connections_number.to_vec(),
            usernames: self.usernames.to_vec(),
            open_files: self.open_files.to_vec(),
            retrieval_timestamps: self.retrieval_timestamps.to_vec(),
        }
    }
}

/// An owned copy of a profile view, carried by summaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSnapshot {
    pub memory_rss: Vec<u64>,
    pub cpu_percent: Vec<f64>,
    pub children_count: Vec<u64>,
    pub threads_number: Vec<u64>,
    pub connections_number: Vec<u64>,
    pub usernames: Vec<Vec<String>>,
    pub open_files: Vec<Vec<String>>,
    pub retrieval_timestamps: Vec<Timestamp>,
}
