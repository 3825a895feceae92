//! Server-side configuration knobs with their deployed defaults.

use serde::{Deserialize, Serialize};

/// Review queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Exclusive lease duration granted to a reviewer per response.
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: i64,
}

fn default_lease_duration_secs() -> i64 {
    1800
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: default_lease_duration_secs(),
        }
    }
}

/// Duplicate detector tolerances and batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Responses fetched per scan batch.
    #[serde(default = "default_dedup_batch_size")]
    pub batch_size: usize,
    /// GPS tolerance in degrees (~11 m at 0.0001).
    #[serde(default = "default_gps_tolerance")]
    pub gps_tolerance: f64,
    /// Start-time tolerance in seconds.
    #[serde(default = "default_time_tolerance_secs")]
    pub time_tolerance_secs: i64,
    /// Audio duration tolerance in seconds.
    #[serde(default = "default_audio_duration_tolerance_secs")]
    pub audio_duration_tolerance_secs: f64,
    /// Audio bitrate tolerance in kbps.
    #[serde(default = "default_audio_bitrate_tolerance")]
    pub audio_bitrate_tolerance_kbps: f64,
    /// Audio file size tolerance in bytes.
    #[serde(default = "default_audio_size_tolerance_bytes")]
    pub audio_size_tolerance_bytes: u64,
}

fn default_dedup_batch_size() -> usize {
    1000
}

fn default_gps_tolerance() -> f64 {
    0.0001
}

fn default_time_tolerance_secs() -> i64 {
    1
}

fn default_audio_duration_tolerance_secs() -> f64 {
    1.0
}

fn default_audio_bitrate_tolerance() -> f64 {
    1.0
}

fn default_audio_size_tolerance_bytes() -> u64 {
    1024
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            batch_size: default_dedup_batch_size(),
            gps_tolerance: default_gps_tolerance(),
            time_tolerance_secs: default_time_tolerance_secs(),
            audio_duration_tolerance_secs: default_audio_duration_tolerance_secs(),
            audio_bitrate_tolerance_kbps: default_audio_bitrate_tolerance(),
            audio_size_tolerance_bytes: default_audio_size_tolerance_bytes(),
        }
    }
}
