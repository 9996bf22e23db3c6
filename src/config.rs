use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::Deserialize;
use thiserror::Error;

use crate::timestamp::{Timestamp, CANONICAL_FORMAT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration. Every field has a default, so a missing config
/// file behaves like an empty one; unknown fields are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WadesConfig {
    /// Target cadence between sample cycles, in seconds.
    pub sample_period_sec: u64,
    /// Upper clamp on the cadence.
    pub max_sample_period_sec: u64,
    /// Minimum historical rows before an attribute is modelled at all.
    pub min_history: usize,
    /// Points needed in a histogram bin for the crowded-bin softening.
    pub min_bin_support: u64,
    /// Paths whose first-time access raises a high-risk anomaly.
    pub prohibited_files: Vec<String>,
    /// Master switch for the detector; sampling runs regardless.
    pub detection_enabled: bool,
    pub query_bind_address: IpAddr,
    pub query_port: u16,
    /// Base directory for profiles, markers and the anomaly log.
    pub store_root: PathBuf,
    /// Format for every persisted timestamp. Must round-trip.
    pub timestamp_format: String,
}

impl Default for WadesConfig {
    fn default() -> WadesConfig {
        WadesConfig {
            sample_period_sec: 180,
            max_sample_period_sec: 3600,
            min_history: 10,
            min_bin_support: 5,
            prohibited_files: ["/etc/passwd", "/etc/shadow", "/etc/bashrc"]
                .into_iter()
                .map(String::from)
                .collect(),
            detection_enabled: true,
            query_bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            query_port: 3335,
            store_root: PathBuf::from("/var/lib/wades"),
            timestamp_format: CANONICAL_FORMAT.to_string(),
        }
    }
}

impl WadesConfig {
    /// Loads and validates the configuration. Validation failures are
    /// fatal to the caller; the daemon refuses to run misconfigured.
    pub fn load(path: Option<&Path>) -> Result<WadesConfig, ConfigError> {
        let config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => WadesConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_period_sec == 0 {
            return Err(ConfigError::Invalid(
                "sample_period_sec must be greater than zero".to_string(),
            ));
        }
        if self.max_sample_period_sec == 0 {
            return Err(ConfigError::Invalid(
                "max_sample_period_sec must be greater than zero".to_string(),
            ));
        }
        if self.query_port == 0 {
            return Err(ConfigError::Invalid(
                "query_port must be greater than zero".to_string(),
            ));
        }
        // A format that loses information would make every stored
        // timestamp unreadable on the next pass. Probe with a reference
        // instant whose every component is nonzero.
        let reference = Timestamp::parse_with("2021-01-31 20:09:03:771116", CANONICAL_FORMAT)
            .expect("the canonical reference timestamp parses");
        let round_trips = match reference.try_format_with(&self.timestamp_format) {
            Ok(formatted) => {
                matches!(Timestamp::parse_with(&formatted, &self.timestamp_format),
                    Ok(parsed) if parsed == reference)
            }
            Err(_) => false,
        };
        if round_trips {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "timestamp_format {:?} does not round-trip",
                self.timestamp_format
            )))
        }
    }

    /// The effective cadence: the configured period, clamped.
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs(self.sample_period_sec.min(self.max_sample_period_sec))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn load_json(contents: &str) -> Result<WadesConfig, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        WadesConfig::load(Some(file.path()))
    }

    #[test]
    fn missing_file_argument_means_defaults() {
        let config = WadesConfig::load(None).unwrap();
        assert_eq!(config.sample_period_sec, 180);
        assert_eq!(config.min_history, 10);
        assert_eq!(config.min_bin_support, 5);
        assert!(config.detection_enabled);
        assert!(config
            .prohibited_files
            .contains(&"/etc/shadow".to_string()));
        assert_eq!(config.sample_period(), Duration::from_secs(180));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config = load_json(r#"{"sample_period_sec": 30, "query_port": 4000}"#).unwrap();
        assert_eq!(config.sample_period_sec, 30);
        assert_eq!(config.query_port, 4000);
        assert_eq!(config.min_history, 10);
    }

    #[test]
    fn cadence_is_clamped_by_the_maximum() {
        let config =
            load_json(r#"{"sample_period_sec": 7200, "max_sample_period_sec": 3600}"#).unwrap();
        assert_eq!(config.sample_period(), Duration::from_secs(3600));
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(matches!(
            load_json(r#"{"sample_period_sec": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn lossy_timestamp_format_is_rejected() {
        // Without the fractional part, microseconds are lost on re-parse.
        assert!(matches!(
            load_json(r#"{"timestamp_format": "%Y-%m-%d %H:%M:%S"}"#),
            Err(ConfigError::Invalid(_))
        ));
        // The misspelled day item formats a literal "d" and cannot parse
        // back into a date.
        assert!(matches!(
            load_json(r#"{"timestamp_format": "%Y-%m-d %H:%M:%S:%6f"}"#),
            Err(ConfigError::Invalid(_))
        ));
        // An unknown format item cannot even be formatted.
        assert!(matches!(
            load_json(r#"{"timestamp_format": "%Q"}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            load_json(r#"{"sample_periodicity": 5}"#),
            Err(ConfigError::Parse { .. })
        ));
    }
}
