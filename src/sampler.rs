use indexmap::IndexMap;
use log::info;
use thiserror::Error;

use crate::probe::{ProbeError, ProcessProbe, ProcessRecord};
use crate::profile::{AppProfile, ProfileError, ProfileRow};
use crate::store::{ProfileStore, StoreError};
use crate::timestamp::Timestamp;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

/// Drives one probe → group → append → persist pass per call.
pub struct Sampler {
    probe: Box<dyn ProcessProbe>,
}

impl Sampler {
    pub fn new(probe: Box<dyn ProcessProbe>) -> Sampler {
        Sampler { probe }
    }

    /// One full sample cycle. Every row written in a cycle carries the
    /// snapshot's timestamp, and the latest-sample marker is written only
    /// after every profile write succeeded, so readers that check the
    /// marker first never observe a cycle in progress.
    pub fn collect_cycle(&mut self, store: &ProfileStore) -> Result<Timestamp, CycleError> {
        let snapshot = self.probe.snapshot()?;
        let timestamp = snapshot.retrieval_timestamp;

        let mut groups: IndexMap<String, Vec<ProcessRecord>> = IndexMap::new();
        for record in snapshot.records {
            groups.entry(record.name.clone()).or_default().push(record);
        }
        info!("sampled {} applications", groups.len());

        for (name, records) in &groups {
            let mut profile = store
                .get(name)
                .unwrap_or_else(|| AppProfile::new(name.clone()));
            for record in records {
                profile.append(row_from_record(record), timestamp)?;
            }
            store.put(&profile)?;
        }

        store.set_last_sample_ts(timestamp)?;
        Ok(timestamp)
    }
}

fn row_from_record(record: &ProcessRecord) -> ProfileRow {
    ProfileRow {
        memory_rss: record.rss_bytes,
        cpu_percent: record.cpu_percent,
        children_count: record.children_count,
        threads_number: record.threads_number,
        connections_number: record.connections_number,
        // A missing username stays an empty list; the row itself is kept.
        usernames: record.username.clone().into_iter().collect(),
        open_files: record.open_files.clone(),
    }
}
