//! Runtime configuration loading and validation.
//!
//! Configuration lives in YAML (or JSON, which YAML parsing accepts) and
//! deserializes into typed sections with serde defaults, so a minimal file
//! only names what it overrides.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use vigil_speculation::SchedulerConfig;
use vigil_store_core::RetentionPolicy;

/// Top-level configuration: the replay core plus the speculation scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Replay bridge settings.
    pub replay: ReplayConfig,
    /// Speculative scheduler settings.
    pub speculation: SchedulerConfig,
}

/// Settings for the observability/replay bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Master switch for the bridge.
    pub enabled: bool,
    /// Trace session identifier.
    pub trace_id: String,
    /// Tracing behavior.
    pub tracing: TracingConfig,
    /// Store selection and retention.
    pub store: StoreConfig,
    /// Backfill tuning.
    pub backfill: BackfillSection,
    /// Comparator tuning.
    pub comparator: ComparatorSection,
    /// Strict projection mode: violations fail the batch.
    pub strict: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trace_id: "vigil".to_string(),
            tracing: TracingConfig::default(),
            store: StoreConfig::default(),
            backfill: BackfillSection::default(),
            comparator: ComparatorSection::default(),
            strict: false,
        }
    }
}

/// Trace synthesis and span emission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Deterministic sampling rate in `[0, 1]`.
    pub sample_rate: f64,
    /// Emit best-effort spans around bridge operations.
    pub emit_otel: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            emit_otel: false,
        }
    }
}

/// Which store driver backs the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// In-memory, non-persistent.
    Memory,
    /// Durable embedded store on disk.
    Durable,
}

/// Store selection and write-time retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Driver choice.
    #[serde(rename = "type")]
    pub kind: StoreKind,
    /// Database path; required for the durable driver.
    pub path: Option<PathBuf>,
    /// Retention limits enforced at write time.
    pub retention: RetentionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: None,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Backfill tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillSection {
    /// Stop once a page begins past this slot.
    pub to_slot: Option<u64>,
    /// Events requested per page.
    pub page_size: u32,
}

impl Default for BackfillSection {
    fn default() -> Self {
        Self {
            to_slot: None,
            page_size: 100,
        }
    }
}

/// Comparator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparatorSection {
    /// Treat drift and one-sided events as errors.
    pub strict: bool,
    /// Allowed timestamp drift between aligned events, milliseconds.
    pub timestamp_epsilon_ms: u64,
}

impl Default for ComparatorSection {
    fn default() -> Self {
        Self {
            strict: false,
            timestamp_epsilon_ms: 1_000,
        }
    }
}

impl VigilConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    /// Parse and validate configuration from YAML (or JSON) text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(contents).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.replay.store.kind == StoreKind::Durable && self.replay.store.path.is_none() {
            anyhow::bail!("replay.store.path is required when replay.store.type is durable");
        }
        let rate = self.replay.tracing.sample_rate;
        if !(0.0..=1.0).contains(&rate) {
            anyhow::bail!("replay.tracing.sample_rate must be within [0, 1], got {rate}");
        }
        if self.replay.backfill.page_size == 0 {
            anyhow::bail!("replay.backfill.page_size must be positive");
        }
        if self.replay.trace_id.trim().is_empty() {
            anyhow::bail!("replay.trace_id cannot be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_an_empty_document() {
        let config = VigilConfig::from_yaml("{}").unwrap();
        assert!(config.replay.enabled);
        assert_eq!(config.replay.trace_id, "vigil");
        assert_eq!(config.replay.store.kind, StoreKind::Memory);
        assert_eq!(config.replay.backfill.page_size, 100);
        assert!(config.speculation.enable_speculation);
    }

    #[test]
    fn recognized_options_round_trip() {
        let yaml = r#"
replay:
  enabled: true
  trace_id: incident-42
  strict: true
  tracing:
    sample_rate: 0.25
    emit_otel: true
  store:
    type: durable
    path: /tmp/vigil-timeline
    retention:
      ttl_ms: 86400000
      max_events_total: 100000
  backfill:
    to_slot: 5000
    page_size: 250
speculation:
  max_speculation_depth: 2
  max_speculative_stake: 777
"#;
        let config = VigilConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.replay.trace_id, "incident-42");
        assert!(config.replay.strict);
        assert_eq!(config.replay.tracing.sample_rate, 0.25);
        assert!(config.replay.tracing.emit_otel);
        assert_eq!(config.replay.store.kind, StoreKind::Durable);
        assert_eq!(
            config.replay.store.retention.max_events_total,
            Some(100_000)
        );
        assert_eq!(config.replay.backfill.to_slot, Some(5_000));
        assert_eq!(config.speculation.max_speculation_depth, 2);
        assert_eq!(config.speculation.max_speculative_stake, 777);
    }

    #[test]
    fn durable_store_requires_a_path() {
        let err = VigilConfig::from_yaml("replay:\n  store:\n    type: durable\n").unwrap_err();
        assert!(err.to_string().contains("invalid") || err.to_string().contains("path"));
    }

    #[test]
    fn sample_rate_is_bounded() {
        let err =
            VigilConfig::from_yaml("replay:\n  tracing:\n    sample_rate: 1.5\n").unwrap_err();
        assert!(format!("{err:#}").contains("sample_rate"));
    }
}
