use std::fmt;

use thiserror::Error;

use crate::timestamp::Timestamp;

/// Per-PID attributes the probe extracts. Used to name what was missing
/// when a record is skipped or partially filled.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAttribute {
    Name,
    Pid,
    Username,
    MemoryInfo,
    OpenFiles,
    CpuPercent,
    ChildrenCount,
    ThreadsNumber,
    Connections,
}

impl fmt::Display for ProcessAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessAttribute::Name => "name",
            ProcessAttribute::Pid => "pid",
            ProcessAttribute::Username => "username",
            ProcessAttribute::MemoryInfo => "memory_info",
            ProcessAttribute::OpenFiles => "open_files",
            ProcessAttribute::CpuPercent => "cpu_percent",
            ProcessAttribute::ChildrenCount => "children_count",
            ProcessAttribute::ThreadsNumber => "threads_number",
            ProcessAttribute::Connections => "connections",
        };
        f.write_str(name)
    }
}

/// One running process as observed by the probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: u32,
    /// `None` when the owning user could not be resolved.
    pub username: Option<String>,
    pub rss_bytes: u64,
    pub cpu_percent: f64,
    /// Deduplicated open file paths; empty for kernel threads and for
    /// processes whose fd table is unreadable.
    pub open_files: Vec<String>,
    pub children_count: u64,
    pub threads_number: u64,
    pub connections_number: u64,
}

/// One full enumeration pass over the process table. All records share
/// `retrieval_timestamp`, taken at the start of the two-phase CPU sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSnapshot {
    pub retrieval_timestamp: Timestamp,
    pub records: Vec<ProcessRecord>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not enumerate processes: {0}")]
    Enumeration(String),
}

/// Contract for the OS process enumeration facility.
///
/// Implementations may return partial snapshots: a PID that vanishes or
/// denies access mid-read is simply absent from the result.
pub trait ProcessProbe: Send {
    fn snapshot(&mut self) -> Result<ProcessSnapshot, ProbeError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;

    use super::*;

    /// Replays prepared snapshots, then fails.
    pub struct ScriptedProbe {
        snapshots: VecDeque<ProcessSnapshot>,
    }

    impl ScriptedProbe {
        pub fn new(snapshots: Vec<ProcessSnapshot>) -> ScriptedProbe {
            ScriptedProbe {
                snapshots: snapshots.into(),
            }
        }
    }

    impl ProcessProbe for ScriptedProbe {
        fn snapshot(&mut self) -> Result<ProcessSnapshot, ProbeError> {
            self.snapshots
                .pop_front()
                .ok_or_else(|| ProbeError::Enumeration("script exhausted".to_string()))
        }
    }

    pub fn record(name: &str, pid: u32, rss_bytes: u64) -> ProcessRecord {
        ProcessRecord {
            name: name.to_string(),
            pid,
            username: Some("alice".to_string()),
            rss_bytes,
            cpu_percent: 1.5,
            open_files: vec!["/var/log/syslog".to_string()],
            children_count: 0,
            threads_number: 2,
            connections_number: 0,
        }
    }
}
