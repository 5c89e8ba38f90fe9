use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning knobs for the [`crate::scheduler`] module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// An unavailability window at or above this duration is "long" (§4.1 Case B);
    /// below it, it is "short" (Case C).
    pub long_unavailability_threshold_secs: i64,
    /// How far ahead the scheduler will place jobs before giving up.
    pub horizon_days: i64,
    /// Whether a job may be placed so that it crosses a short unavailability
    /// window when no smaller job fits before it.
    pub allow_spanning_short_windows: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            long_unavailability_threshold_secs: 3 * 3600,
            horizon_days: 7,
            allow_spanning_short_windows: true,
        }
    }
}

/// Tuning knobs for the [`crate::store`] module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the JSON snapshot file on disk.
    pub snapshot_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_dir().join("printassist-store.json"),
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("printassist"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Tuning knobs for the [`crate::adapter`] and [`crate::coordinator`] modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Soft tick interval for the periodic schedule refresh.
    pub refresh_interval_secs: u64,
    /// Conservative fallback when an unknown print has no reported end time.
    pub unknown_print_fallback_secs: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            unknown_print_fallback_secs: 3600,
        }
    }
}

impl CoordinatorConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
