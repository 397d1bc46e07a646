use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::processor::FeatureName;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("parse config {path}: {source}")]
    Parse { path: String, source: serde_json::Error },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Immutable runtime configuration, built once at startup and handed to every component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub lan_subnet: Ipv4Addr,
    pub lan_prefix_len: u8,
    /// Width of the statistical window, in seconds
    pub window_secs: f64,
    /// How often accumulated packets are pushed through the pipeline
    pub batch_interval_secs: u64,
    /// Consecutive same-direction verdicts needed to flip streaming state
    pub hysteresis: u32,
    pub streaming_threshold: f32,
    pub quota_secs: f64,
    pub idle_timeout_secs: f64,
    /// How often the running monitor evicts idle clients
    pub cleanup_interval_secs: u64,
    /// Ordered model input columns
    pub selected_features: Vec<FeatureName>,
    pub model_path: PathBuf,
    pub state_path: PathBuf,
    pub blocklist_path: PathBuf,
    pub capture_filter: String,
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lan_subnet: Ipv4Addr::new(192, 168, 0, 0),
            lan_prefix_len: 24,
            window_secs: 10.0,
            batch_interval_secs: 10,
            hysteresis: 3,
            streaming_threshold: 0.6,
            quota_secs: 3600.0,
            idle_timeout_secs: 3600.0,
            cleanup_interval_secs: 300,
            selected_features: vec![
                FeatureName::AckEntropy,
                FeatureName::TtlEntropy,
                FeatureName::TcpAckVar,
                FeatureName::UdpNports,
                FeatureName::PktEntropy,
                FeatureName::DwPktAvg,
                FeatureName::DwTtlAvg,
                FeatureName::DwTtlUnique,
                FeatureName::DwPktEntropy,
                FeatureName::DlPktAvg,
            ],
            model_path: PathBuf::from("model.onnx"),
            state_path: PathBuf::from("clients.json"),
            blocklist_path: PathBuf::from("/etc/blocked-ips-v4.txt"),
            capture_filter: "ip".to_string(),
            channel_capacity: 65_536,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&s).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path: path.display().to_string(), source },
            other => other,
        })
    }

    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(s).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lan_prefix_len > 32 {
            return Err(ConfigError::Invalid(format!("lan_prefix_len {} exceeds 32", self.lan_prefix_len)));
        }
        if !(self.window_secs > 0.0) {
            return Err(ConfigError::Invalid("window_secs must be positive".into()));
        }
        if self.batch_interval_secs == 0 {
            return Err(ConfigError::Invalid("batch_interval_secs must be positive".into()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid("cleanup_interval_secs must be positive".into()));
        }
        if self.hysteresis == 0 {
            return Err(ConfigError::Invalid("hysteresis must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.streaming_threshold) {
            return Err(ConfigError::Invalid(format!(
                "streaming_threshold {} outside [0, 1]",
                self.streaming_threshold
            )));
        }
        if !(self.quota_secs >= 0.0) || !(self.idle_timeout_secs >= 0.0) {
            return Err(ConfigError::Invalid("quota_secs and idle_timeout_secs must be non-negative".into()));
        }
        if self.selected_features.is_empty() {
            return Err(ConfigError::Invalid("selected_features is empty".into()));
        }
        let mut seen = HashSet::new();
        for f in &self.selected_features {
            if !seen.insert(*f) {
                return Err(ConfigError::Invalid(format!("feature {} selected twice", f.as_str())));
            }
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.hysteresis, 3);
        assert_eq!(config.selected_features.len(), 10);
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_json(
            r#"{"lan_subnet": "10.0.0.0", "lan_prefix_len": 8, "quota_secs": 60,
                "selected_features": ["jitter", "num_unique_ips"]}"#,
        )
        .unwrap();
        assert_eq!(config.lan_subnet, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(config.lan_prefix_len, 8);
        assert_eq!(config.quota_secs, 60.0);
        assert_eq!(config.selected_features, vec![FeatureName::Jitter, FeatureName::NumUniqueIps]);
    }

    #[test]
    fn unknown_feature_is_rejected_at_load() {
        let err = Config::from_json(r#"{"selected_features": ["pkt_entropy", "bogus"]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for doc in [
            r#"{"lan_prefix_len": 33}"#,
            r#"{"window_secs": 0}"#,
            r#"{"hysteresis": 0}"#,
            r#"{"cleanup_interval_secs": 0}"#,
            r#"{"streaming_threshold": 1.5}"#,
            r#"{"selected_features": []}"#,
            r#"{"selected_features": ["jitter", "jitter"]}"#,
        ] {
            assert!(matches!(Config::from_json(doc), Err(ConfigError::Invalid(_))), "{doc}");
        }
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
