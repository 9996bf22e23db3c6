use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::warn;
use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::profile::{AppProfile, AppProfileAttribute, ProfileParts};
use crate::risk::RiskLevel;
use crate::summary::AppSummary;
use crate::timestamp::Timestamp;

const INDEX_FILE: &str = "profiles.index.json";
const MARKER_FILE: &str = "last_sample_timestamp";
const ANOMALY_LOG_FILE: &str = "anomaly_log.jsonl";

/// Write-side failures. Read-side problems (missing files, malformed
/// content) are not errors: the affected artifact reads as absent and the
/// next write re-establishes well-formed content.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encode {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk layout of one profile. Timestamps are strings in the store's
/// configured format; counts stay integers and cpu percentages stay
/// floats, so decoding restores the exact numeric types.
#[derive(Debug, Serialize, Deserialize)]
struct ProfileDoc {
    name: String,
    created_at: String,
    memory_rss: Vec<u64>,
    cpu_percent: Vec<f64>,
    children_count: Vec<u64>,
    threads_number: Vec<u64>,
    connections_number: Vec<u64>,
    usernames: Vec<Vec<String>>,
    open_files_batches: Vec<Vec<String>>,
    retrieval_timestamps: Vec<String>,
}

/// One anomaly log record. The log is append-only and never deduplicated:
/// an anomaly that persists across cycles appears once per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEntry {
    pub risk: RiskLevel,
    pub error_message: Option<String>,
    pub abnormal_attributes: Vec<AppProfileAttribute>,
    pub latest_batch_timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnomalyLogLine {
    app_name: String,
    #[serde(flatten)]
    entry: AnomalyEntry,
}

/// The persistent profile store.
///
/// Application names may contain path-hostile characters, so an ordered
/// name→id table assigns each application a stable small integer and the
/// profile file is named after that id. Profile and marker writes go
/// through a temp file plus rename, so a failed write never corrupts the
/// previous content.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    root: PathBuf,
    timestamp_format: String,
}

impl ProfileStore {
    pub fn open(root: &Path, timestamp_format: &str) -> Result<ProfileStore, StoreError> {
        fs::create_dir_all(root).map_err(|source| StoreError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(ProfileStore {
            root: root.to_path_buf(),
            timestamp_format: timestamp_format.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<AppProfile> {
        let index = self.load_index();
        let id = *index.get(name)?;
        let path = self.profile_path(id);
        let mut contents = String::new();
        match File::open(&path) {
            Ok(mut file) => {
                if let Err(err) = file.read_to_string(&mut contents) {
                    warn!("could not read {}: {err}", path.display());
                    return None;
                }
            }
            Err(_) => return None,
        }
        let doc: ProfileDoc = match serde_json::from_str(&contents) {
            Ok(doc) => doc,
            Err(err) => {
                warn!("treating malformed profile {} as empty: {err}", path.display());
                return None;
            }
        };
        self.decode(doc, &path)
    }

    pub fn put(&self, profile: &AppProfile) -> Result<(), StoreError> {
        let mut index = self.load_index();
        let id = match index.get(profile.name()) {
            Some(&id) => id,
            None => {
                let id = index.len() as u32;
                index.insert(profile.name().to_string(), id);
                self.write_json_atomic(&self.root.join(INDEX_FILE), &index)?;
                id
            }
        };
        let doc = self.encode(profile);
        self.write_json_atomic(&self.profile_path(id), &doc)
    }

    /// All known application names, in first-seen order.
    pub fn list_names(&self) -> Vec<String> {
        self.load_index().keys().cloned().collect()
    }

    pub fn get_last_sample_ts(&self) -> Option<Timestamp> {
        let path = self.root.join(MARKER_FILE);
        let contents = fs::read_to_string(&path).ok()?;
        match Timestamp::parse_with(contents.trim(), &self.timestamp_format) {
            Ok(ts) => Some(ts),
            Err(err) => {
                warn!("ignoring malformed sample marker: {err}");
                None
            }
        }
    }

    pub fn set_last_sample_ts(&self, ts: Timestamp) -> Result<(), StoreError> {
        let path = self.root.join(MARKER_FILE);
        self.write_atomic(&path, ts.format_with(&self.timestamp_format).as_bytes())
    }

    /// Appends one summary to the anomaly log.
    pub fn append_anomaly(&self, summary: &AppSummary) -> Result<(), StoreError> {
        let path = self.root.join(ANOMALY_LOG_FILE);
        let line = AnomalyLogLine {
            app_name: summary.app_name.clone(),
            entry: AnomalyEntry {
                risk: summary.risk,
                error_message: summary.error_message.clone(),
                abnormal_attributes: summary.abnormal_attributes.iter().copied().collect(),
                latest_batch_timestamp: summary
                    .latest_batch_timestamp()
                    .map(|ts| ts.format_with(&self.timestamp_format))
                    .unwrap_or_default(),
            },
        };
        let encoded = serde_json::to_string(&line).map_err(|source| StoreError::Encode {
            path: path.clone(),
            source,
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        writeln!(file, "{encoded}").map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        file.flush().map_err(|source| StoreError::Io { path, source })
    }

    /// Every recorded anomaly, grouped by application name. Malformed
    /// lines are skipped.
    pub fn read_anomalies(&self) -> FxHashMap<String, Vec<AnomalyEntry>> {
        let path = self.root.join(ANOMALY_LOG_FILE);
        let mut anomalies: FxHashMap<String, Vec<AnomalyEntry>> = FxHashMap::default();
        let Ok(file) = File::open(&path) else {
            return anomalies;
        };
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AnomalyLogLine>(&line) {
                Ok(parsed) => anomalies
                    .entry(parsed.app_name)
                    .or_default()
                    .push(parsed.entry),
                Err(err) => warn!("skipping malformed anomaly log line: {err}"),
            }
        }
        anomalies
    }

    fn profile_path(&self, id: u32) -> PathBuf {
        self.root.join(format!("{id}.profile.json"))
    }

    fn load_index(&self) -> IndexMap<String, u32> {
        let path = self.root.join(INDEX_FILE);
        let Ok(contents) = fs::read_to_string(&path) else {
            return IndexMap::new();
        };
        match serde_json::from_str(&contents) {
            Ok(index) => index,
            Err(err) => {
                warn!("treating malformed profile index as empty: {err}");
                IndexMap::new()
            }
        }
    }

    fn encode(&self, profile: &AppProfile) -> ProfileDoc {
        let parts = profile.clone().into_parts();
        ProfileDoc {
            name: parts.name,
            created_at: parts.created_at.format_with(&self.timestamp_format),
            memory_rss: parts.memory_rss,
            cpu_percent: parts.cpu_percent,
            children_count: parts.children_count,
            threads_number: parts.threads_number,
            connections_number: parts.connections_number,
            usernames: parts.usernames,
            open_files_batches: parts.open_files_batches,
            retrieval_timestamps: parts
                .retrieval_timestamps
                .iter()
                .map(|ts| ts.format_with(&self.timestamp_format))
                .collect(),
        }
    }

    fn decode(&self, doc: ProfileDoc, path: &Path) -> Option<AppProfile> {
        let created_at = match Timestamp::parse_with(&doc.created_at, &self.timestamp_format) {
            Ok(ts) => ts,
            Err(err) => {
                warn!("treating malformed profile {} as empty: {err}", path.display());
                return None;
            }
        };
        let mut retrieval_timestamps = Vec::with_capacity(doc.retrieval_timestamps.len());
        for value in &doc.retrieval_timestamps {
            match Timestamp::parse_with(value, &self.timestamp_format) {
                Ok(ts) => retrieval_timestamps.push(ts),
                Err(err) => {
                    warn!("treating malformed profile {} as empty: {err}", path.display());
                    return None;
                }
            }
        }
        let parts = ProfileParts {
            name: doc.name,
            created_at,
            memory_rss: doc.memory_rss,
            cpu_percent: doc.cpu_percent,
            children_count: doc.children_count,
            threads_number: doc.threads_number,
            connections_number: doc.connections_number,
            usernames: doc.usernames,
            open_files_batches: doc.open_files_batches,
            retrieval_timestamps,
        };
        match AppProfile::from_parts(parts) {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!("treating malformed profile {} as empty: {err}", path.display());
                None
            }
        }
    }

    fn write_json_atomic<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StoreError> {
        let temp = tempfile::NamedTempFile::new_in(&self.root).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer(&mut writer, value).map_err(|source| StoreError::Encode {
                path: path.to_path_buf(),
                source,
            })?;
            writer.flush().map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        temp.persist(path).map_err(|err| StoreError::Io {
            path: path.to_path_buf(),
            source: err.error,
        })?;
        Ok(())
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), StoreError> {
        let mut temp =
            tempfile::NamedTempFile::new_in(&self.root).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        temp.write_all(contents).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        temp.persist(path).map_err(|err| StoreError::Io {
            path: path.to_path_buf(),
            source: err.error,
        })?;
        Ok(())
    }
}
