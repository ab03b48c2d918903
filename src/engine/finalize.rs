use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::session::SessionState;
use crate::coordinator::Coordinator;
use crate::error::{EngineError, EngineResult};
use crate::fs::FileSystem;
use crate::hashing::calculate_hash;
use crate::item::{DownloadItem, ItemStatus};
use crate::utils::suggested_file_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Some segment is still missing bytes, or the session was canceled.
    NotReady,
    AlreadyFinalized,
    Completed(PathBuf),
}

/// Moves a fully received temp file into place and reports the item complete.
///
/// Runs at most once per session: later calls return `AlreadyFinalized`
/// without touching the filesystem. A size mismatch between the temp file
/// and the expected total is an error and leaves the temp file where it is.
pub async fn finalize(
    state: &mut SessionState,
    item: &mut DownloadItem,
    fs: &dyn FileSystem,
    coordinator: &dyn Coordinator,
    compute_checksum: bool,
) -> EngineResult<FinalizeOutcome> {
    if state.finalized {
        return Ok(FinalizeOutcome::AlreadyFinalized);
    }
    if state.canceled || !state.is_complete() {
        return Ok(FinalizeOutcome::NotReady);
    }

    let final_path = commit_temp_file(&state.temp_path, Some(state.total_bytes), item, fs).await?;
    state.finalized = true;
    state.clear();

    item.total_bytes = state.total_bytes;
    item.mark_segments_done();
    complete_item(item, final_path.clone(), coordinator, compute_checksum).await;
    Ok(FinalizeOutcome::Completed(final_path))
}

/// Size-checks the temp file and hands it to the filesystem collaborator.
pub(crate) async fn commit_temp_file(
    temp_path: &Path,
    expected: Option<u64>,
    item: &DownloadItem,
    fs: &dyn FileSystem,
) -> EngineResult<PathBuf> {
    let actual = fs.file_len(temp_path).await?.ok_or(EngineError::TempFileMissing)?;
    if let Some(expected) = expected {
        if actual != expected {
            return Err(EngineError::SizeMismatch { expected, actual });
        }
    }

    let name = suggested_file_name(item);
    fs.move_into_destination(temp_path, &name, item.destination.as_deref())
        .await
        .map_err(EngineError::Move)
}

/// Reports completion, then the checksum as a follow-up update.
pub(crate) async fn complete_item(
    item: &mut DownloadItem,
    final_path: PathBuf,
    coordinator: &dyn Coordinator,
    compute_checksum: bool,
) {
    info!(id = %item.id, path = %final_path.display(), "download completed");
    item.status = ItemStatus::Completed;
    item.final_path = Some(final_path.clone());
    item.speed = 0.0;
    item.eta_secs = Some(0);
    item.last_error = None;
    item.touch();
    coordinator.report_progress(item.clone());

    if !compute_checksum {
        return;
    }
    match calculate_hash(&final_path).await {
        Ok(hash) => {
            if let Some(expected) = &item.expected_checksum {
                if !expected.eq_ignore_ascii_case(&hash) {
                    warn!(id = %item.id, %expected, actual = %hash, "checksum mismatch");
                    let message = format!("checksum mismatch: expected {}, got {}", expected, hash);
                    item.append_error(&message);
                }
            }
            item.checksum = Some(hash);
        }
        Err(e) => {
            warn!(id = %item.id, error = %e, "checksum failed");
            item.append_error(&format!("checksum failed: {}", e));
        }
    }
    item.touch();
    coordinator.report_progress(item.clone());
}
