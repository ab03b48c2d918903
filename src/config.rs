use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for [`Engine`](crate::engine::Engine).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding `<item-id>.part` temp files.
    pub temp_dir: PathBuf,
    pub max_segment_retries: u32,
    /// Content-range start mismatches tolerated per segment.
    pub max_range_rejects: u32,
    /// "200 instead of 206" responses tolerated per segment.
    pub max_ignored_ranges: u32,
    pub backoff_unit: Duration,
    pub backoff_cap: Duration,
    pub progress_report_bytes: u64,
    pub stall_timeout: Duration,
    pub segment_count_override: Option<usize>,
    /// Hosts that reject HEAD; probed with a one-byte ranged GET instead.
    pub head_rejecting_hosts: Vec<String>,
    /// Hosts whose access-denied answers mean the signed URL went stale.
    /// Empty by default; the CLI fills it from `--refresh-host`.
    pub refresh_hosts: Vec<String>,
    pub compute_checksum: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("rangedl"),
            max_segment_retries: 5,
            max_range_rejects: 3,
            max_ignored_ranges: 2,
            backoff_unit: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            progress_report_bytes: 1024 * 1024,
            stall_timeout: Duration::from_secs(60),
            segment_count_override: None,
            head_rejecting_hosts: vec![],
            refresh_hosts: vec![],
            compute_checksum: true,
        }
    }
}

impl EngineConfig {
    /// `min(cap, unit * 2^attempt)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.backoff_unit.saturating_mul(factor).min(self.backoff_cap)
    }

    pub fn rejects_head(&self, url: &str) -> bool {
        host_matches(url, &self.head_rejecting_hosts)
    }

    pub fn requires_refresh(&self, url: &str) -> bool {
        host_matches(url, &self.refresh_hosts)
    }
}

fn host_matches(url: &str, hosts: &[String]) -> bool {
    let Some(host) = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    else {
        return false;
    };
    hosts.iter().any(|h| {
        let h = h.to_ascii_lowercase();
        host == h || host.ends_with(&format!(".{h}"))
    })
}
