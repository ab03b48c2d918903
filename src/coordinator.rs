use crate::item::{DownloadItem, ItemId};

/// Owner of the durable item records. The engine reads through `get_item`
/// and hands every change back through `report_progress`; it never persists.
///
/// `report_progress` is called from the per-item session task and must not
/// block on storage.
pub trait Coordinator: Send + Sync {
    fn get_item(&self, id: ItemId) -> Option<DownloadItem>;
    fn report_progress(&self, item: DownloadItem);
}
