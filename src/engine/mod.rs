//! The download engine.
//!
//! Every item that is being worked on gets one driver task. The driver owns
//! the item's session state outright, so all mutation of per-item maps and
//! every write into the item's temp file happens on that one task. Fetch
//! workers only talk to it through a channel, and the public API reaches it
//! through a command channel.

mod driver;
mod finalize;
mod session;
mod single;
mod worker;
mod writer;

pub use finalize::{finalize, FinalizeOutcome};
pub use session::SessionState;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::fs::FileSystem;
use crate::item::{DownloadItem, ItemId, ItemStatus};
use crate::resolver::UrlResolver;
use crate::transport::Transport;

const COMMAND_BUFFER: usize = 16;

pub(crate) enum Command {
    Pause(oneshot::Sender<DownloadItem>),
    Resume(DownloadItem),
    Cancel(oneshot::Sender<DownloadItem>),
}

/// Collaborators shared by every driver task.
pub(crate) struct EngineContext {
    pub config: EngineConfig,
    pub transport: Arc<dyn Transport>,
    pub coordinator: Arc<dyn Coordinator>,
    pub fs: Arc<dyn FileSystem>,
    pub resolver: Arc<dyn UrlResolver>,
}

impl EngineContext {
    pub fn temp_path(&self, id: ItemId) -> PathBuf {
        self.config.temp_dir.join(format!("{}.part", id))
    }

    pub fn report(&self, item: &mut DownloadItem) {
        item.touch();
        self.coordinator.report_progress(item.clone());
    }
}

struct SessionHandle {
    commands: mpsc::Sender<Command>,
    serial: u64,
}

type Registry = Arc<Mutex<HashMap<ItemId, SessionHandle>>>;

pub struct Engine {
    context: Arc<EngineContext>,
    sessions: Registry,
    next_serial: AtomicU64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        coordinator: Arc<dyn Coordinator>,
        fs: Arc<dyn FileSystem>,
        resolver: Arc<dyn UrlResolver>,
    ) -> Self {
        Self {
            context: Arc::new(EngineContext {
                config,
                transport,
                coordinator,
                fs,
                resolver,
            }),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_serial: AtomicU64::new(0),
        }
    }

    pub fn temp_path(&self, id: ItemId) -> PathBuf {
        self.context.temp_path(id)
    }

    /// Starts downloading `item`. A no-op when the item already has a live
    /// session or is completed/canceled; a failed item is retried.
    pub async fn start(&self, item: &DownloadItem) {
        if matches!(item.status, ItemStatus::Completed | ItemStatus::Canceled) {
            debug!(id = %item.id, status = ?item.status, "start ignored for terminal item");
            return;
        }
        if let Some(commands) = self.live_sender(item.id).await {
            // a paused live session picks up again; an active one ignores this
            if commands.send(Command::Resume(item.clone())).await.is_ok() {
                return;
            }
        }
        self.spawn_driver(item.clone()).await;
    }

    /// Resumes a paused (or failed) item. Warm when its session is still
    /// live, otherwise rebuilt from the durable record.
    pub async fn resume(&self, item: &DownloadItem) {
        let durable = self
            .context
            .coordinator
            .get_item(item.id)
            .unwrap_or_else(|| item.clone());
        if matches!(durable.status, ItemStatus::Completed | ItemStatus::Canceled) {
            debug!(id = %item.id, status = ?durable.status, "resume ignored for terminal item");
            return;
        }
        if let Some(commands) = self.live_sender(item.id).await {
            if commands.send(Command::Resume(durable.clone())).await.is_ok() {
                return;
            }
        }
        info!(id = %item.id, "cold resume");
        self.spawn_driver(durable).await;
    }

    /// Pauses a live item; returns once its progress snapshot has been reported.
    pub async fn pause(&self, item: &DownloadItem) -> Option<DownloadItem> {
        let commands = self.live_sender(item.id).await?;
        let (reply, rx) = oneshot::channel();
        commands.send(Command::Pause(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn cancel(&self, item: &DownloadItem) {
        if let Some(commands) = self.live_sender(item.id).await {
            let (reply, rx) = oneshot::channel();
            if commands.send(Command::Cancel(reply)).await.is_ok() && rx.await.is_ok() {
                return;
            }
        }

        let mut item = self
            .context
            .coordinator
            .get_item(item.id)
            .unwrap_or_else(|| item.clone());
        if item.status.is_terminal() && item.status != ItemStatus::Failed {
            return;
        }
        if let Err(e) = self.context.fs.remove(&self.context.temp_path(item.id)).await {
            warn!(id = %item.id, error = %e, "could not remove temp file");
        }
        item.status = ItemStatus::Canceled;
        item.speed = 0.0;
        item.eta_secs = None;
        self.context.report(&mut item);
    }

    pub async fn is_live(&self, id: ItemId) -> bool {
        self.live_sender(id).await.is_some()
    }

    pub async fn live_items(&self) -> Vec<ItemId> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .filter(|(_, handle)| !handle.commands.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    async fn live_sender(&self, id: ItemId) -> Option<mpsc::Sender<Command>> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&id)
            .filter(|handle| !handle.commands.is_closed())
            .map(|handle| handle.commands.clone())
    }

    async fn spawn_driver(&self, item: DownloadItem) {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(&item.id) {
            if !handle.commands.is_closed() {
                return;
            }
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        sessions.insert(
            item.id,
            SessionHandle {
                commands: tx,
                serial,
            },
        );
        drop(sessions);

        let context = self.context.clone();
        let registry = self.sessions.clone();
        tokio::spawn(async move {
            let id = item.id;
            driver::Driver::new(context, item, rx).run().await;

            let mut sessions = registry.lock().await;
            if sessions.get(&id).map(|h| h.serial) == Some(serial) {
                sessions.remove(&id);
            }
        });
    }
}
