use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::segment::{Segment, SegmentState};

pub type ItemId = Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Queued,
    Probing,
    Downloading,
    Reconnecting,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// The durable record of one download. Owned by the coordinator; the engine
/// works on a copy and hands every change back through `report_progress`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownloadItem {
    pub id: ItemId,
    pub url: String,
    /// Page the media URL was extracted from; handed to the URL resolver.
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub received_bytes: u64,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    /// Preferred destination directory chosen by the user.
    #[serde(default)]
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub final_path: Option<PathBuf>,
    #[serde(default)]
    pub supports_ranges: Option<bool>,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub eta_secs: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub expected_checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadItem {
    pub fn new(url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            page_url: None,
            total_bytes: 0,
            received_bytes: 0,
            segments: vec![],
            status: ItemStatus::Queued,
            request_headers: BTreeMap::new(),
            destination: None,
            file_name: None,
            final_path: None,
            supports_ranges: None,
            speed: 0.0,
            eta_secs: None,
            last_error: None,
            checksum: None,
            expected_checksum: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_destination(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination = Some(dir.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Copies per-segment progress in and refreshes the derived byte count.
    pub fn set_segments(&mut self, segments: &[Segment]) {
        self.segments = segments.to_vec();
        self.received_bytes = segments.iter().map(|s| s.received.min(s.len())).sum();
    }

    pub fn mark_segments_done(&mut self) {
        for seg in &mut self.segments {
            seg.received = seg.len();
            seg.state = SegmentState::Done;
        }
        self.received_bytes = self.total_bytes;
    }

    pub fn append_error(&mut self, message: &str) {
        self.last_error = Some(match self.last_error.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}; {message}"),
            _ => message.to_string(),
        });
    }

    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.received_bytes as f64 / self.total_bytes as f64
        }
    }
}
