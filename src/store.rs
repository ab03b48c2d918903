use anyhow::{Context, Result};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use rangedl::{Coordinator, DownloadItem, ItemId, ItemStatus};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// JSON file holding every item record, rewritten in the background.
pub struct ItemStore {
    path: PathBuf,
    items: Mutex<BTreeMap<ItemId, DownloadItem>>,
    dirty: Notify,
}

impl ItemStore {
    pub async fn load(path: &Path) -> Result<Arc<Self>> {
        let items = if path.exists() {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read state file {:?}", path))?;
            let list: Vec<DownloadItem> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state file {:?}", path))?;
            list.into_iter().map(|item| (item.id, item)).collect()
        } else {
            BTreeMap::new()
        };

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            items: Mutex::new(items),
            dirty: Notify::new(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ItemId, DownloadItem>> {
        // a panic elsewhere must not take the item list down with it
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: ItemId) -> Option<DownloadItem> {
        self.lock().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<DownloadItem> {
        self.lock().values().cloned().collect()
    }

    pub fn find_by_url(&self, url: &str) -> Option<DownloadItem> {
        self.lock()
            .values()
            .filter(|item| item.url == url && item.status != ItemStatus::Canceled)
            .max_by_key(|item| item.updated_at)
            .cloned()
    }

    pub fn upsert(&self, item: DownloadItem) {
        self.lock().insert(item.id, item);
        self.dirty.notify_one();
    }

    pub async fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.all())?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write state file {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .await
            .context("Failed to replace state file")?;
        Ok(())
    }

    /// Persists the list shortly after each change, off the engine's path.
    pub fn spawn_saver(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                store.dirty.notified().await;
                tokio::time::sleep(SAVE_DEBOUNCE).await;
                if let Err(e) = store.save().await {
                    warn!(error = %e, "saving item list failed");
                }
            }
        })
    }
}

/// Progress bars in the style of the item list: a summary line plus one bar per item.
pub struct ProgressView {
    multi_progress: MultiProgress,
    header_pb: ProgressBar,
    bars: Mutex<HashMap<ItemId, ProgressBar>>,
    total_files: usize,
}

impl ProgressView {
    pub fn new(total_files: usize) -> Self {
        let multi_progress = MultiProgress::new();
        multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

        let header_pb = multi_progress.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::default_bar().template("{msg}") {
            header_pb.set_style(style);
        }
        header_pb.set_message(format!("Summary: Files: 0/{} | Downloaded: 0 B", total_files));

        Self {
            multi_progress,
            header_pb,
            bars: Mutex::new(HashMap::new()),
            total_files,
        }
    }

    pub fn println(&self, line: String) {
        let _ = self.multi_progress.println(line);
    }

    fn update(&self, item: &DownloadItem) {
        let name = display_name(item);
        let mut bars = self.bars.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let pb = bars.entry(item.id).or_insert_with(|| {
            let pb = self.multi_progress.add(ProgressBar::new(item.total_bytes));
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
            {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb
        });

        pb.set_length(item.total_bytes);
        pb.set_position(item.received_bytes);
        match item.status {
            ItemStatus::Completed => match &item.last_error {
                Some(err) => pb.finish_with_message(format!("Completed   {} ({})", name, err)),
                None => pb.finish_with_message(format!("Completed   {}", name)),
            },
            ItemStatus::Failed => pb.abandon_with_message(format!(
                "Failed      {}: {}",
                name,
                item.last_error.as_deref().unwrap_or("unknown error")
            )),
            ItemStatus::Canceled => pb.abandon_with_message(format!("Canceled    {}", name)),
            ItemStatus::Paused => pb.set_message(format!("Paused      {}", name)),
            ItemStatus::Probing => pb.set_message(format!("Probing     {}", name)),
            ItemStatus::Reconnecting => pb.set_message(format!("Reconnecting {}", name)),
            ItemStatus::Queued | ItemStatus::Downloading => {
                pb.set_message(format!("Downloading {}", name))
            }
        }

        let (done, bytes, known) = bars_summary(&bars);
        self.header_pb.set_message(format!(
            "Summary: Files: {}/{} | Downloaded: {} / {}",
            done,
            self.total_files,
            HumanBytes(bytes),
            HumanBytes(known)
        ));
        self.header_pb.tick();
    }
}

fn bars_summary(bars: &HashMap<ItemId, ProgressBar>) -> (usize, u64, u64) {
    bars.values().fold((0, 0, 0), |(done, bytes, known), pb| {
        let finished = pb.is_finished() && pb.position() == pb.length().unwrap_or(0);
        (
            done + finished as usize,
            bytes + pb.position(),
            known + pb.length().unwrap_or(0),
        )
    })
}

pub fn display_name(item: &DownloadItem) -> String {
    item.final_path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| rangedl::utils::suggested_file_name(item))
}

/// The command-line coordinator: records every report in the store, draws
/// it, and forwards paused/terminal items to the command loop.
pub struct CliCoordinator {
    store: Arc<ItemStore>,
    view: Arc<ProgressView>,
    settled: mpsc::UnboundedSender<DownloadItem>,
}

impl CliCoordinator {
    pub fn new(
        store: Arc<ItemStore>,
        view: Arc<ProgressView>,
    ) -> (Self, mpsc::UnboundedReceiver<DownloadItem>) {
        let (settled, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                view,
                settled,
            },
            rx,
        )
    }
}

impl Coordinator for CliCoordinator {
    fn get_item(&self, id: ItemId) -> Option<DownloadItem> {
        self.store.get(id)
    }

    fn report_progress(&self, item: DownloadItem) {
        self.view.update(&item);
        let settled = item.status.is_terminal() || item.status == ItemStatus::Paused;
        self.store.upsert(item.clone());
        if settled {
            let _ = self.settled.send(item);
        }
    }
}
