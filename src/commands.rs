use anyhow::{bail, Context, Result};
use indicatif::HumanBytes;
use rangedl::{
    CommandResolver, Coordinator, DownloadItem, Engine, EngineConfig, ItemId, ItemStatus,
    LocalFileSystem, NoResolver, ReqwestTransport, UrlResolver,
};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::cli::VerifyMode;
use crate::store::{display_name, CliCoordinator, ItemStore, ProgressView};

#[derive(Clone, Debug)]
pub struct Task {
    pub url: String,
    pub hash: Option<String>,
}

pub struct RunOptions {
    pub download_dir: PathBuf,
    pub state_file: PathBuf,
    pub concurrency: Option<usize>,
    pub rate_limit: Option<u32>,
    pub split: Option<usize>,
    pub verify_mode: VerifyMode,
    pub resolver: Option<(String, Vec<String>)>,
    pub resolver_timeout: Duration,
    pub refresh_hosts: Vec<String>,
    pub head_reject_hosts: Vec<String>,
    pub headers: Vec<(String, String)>,
}

pub async fn read_tasks_file(input: &Path) -> Result<Vec<Task>> {
    let file = fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open input file: {:?}", input))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut tasks = vec![];
    while let Some(line) = lines.next_line().await? {
        if let Some(task) = parse_task_line(&line) {
            tasks.push(task);
        }
    }
    Ok(tasks)
}

fn parse_task_line(line: &str) -> Option<Task> {
    let raw = line.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }
    let mut parts = raw.splitn(2, '|');
    let url = parts.next().unwrap_or_default().trim().to_string();
    let hash = parts
        .next()
        .map(|h| h.trim().to_string())
        .filter(|s| !s.is_empty());
    (!url.is_empty()).then_some(Task { url, hash })
}

pub fn parse_header(raw: &str) -> Result<(String, String)> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("Invalid header {:?}, expected `Name: value`", raw),
    }
}

fn engine_config(options: &RunOptions) -> EngineConfig {
    EngineConfig {
        temp_dir: options.download_dir.join(".rangedl"),
        segment_count_override: options.split.filter(|n| *n > 0),
        head_rejecting_hosts: options.head_reject_hosts.clone(),
        refresh_hosts: options.refresh_hosts.clone(),
        compute_checksum: options.verify_mode != VerifyMode::Off,
        ..EngineConfig::default()
    }
}

pub async fn run_downloads(tasks: Vec<Task>, options: RunOptions) -> Result<()> {
    if tasks.is_empty() {
        println!("Nothing to download.");
        return Ok(());
    }
    if options.verify_mode == VerifyMode::On {
        let missing: Vec<&str> = tasks
            .iter()
            .filter(|t| t.hash.is_none())
            .map(|t| t.url.as_str())
            .collect();
        if !missing.is_empty() {
            bail!("--verify-hash on, but these entries have no hash: {:?}", missing);
        }
    }
    if !options.download_dir.exists() {
        fs::create_dir_all(&options.download_dir)
            .await
            .context("Failed to create output directory")?;
    }

    let store = ItemStore::load(&options.state_file).await?;
    let saver = store.spawn_saver();
    let view = Arc::new(ProgressView::new(tasks.len()));
    let (coordinator, mut settled) = CliCoordinator::new(store.clone(), view.clone());
    let coordinator: Arc<dyn Coordinator> = Arc::new(coordinator);

    let transport = ReqwestTransport::new(concat!("rangedl/", env!("CARGO_PKG_VERSION")), options.rate_limit)
        .context("Failed to build HTTP client")?;
    let resolver: Arc<dyn UrlResolver> = match &options.resolver {
        Some((program, args)) => Arc::new(
            CommandResolver::new(program.clone(), args.clone()).with_timeout(options.resolver_timeout),
        ),
        None => Arc::new(NoResolver),
    };
    let engine = Engine::new(
        engine_config(&options),
        Arc::new(transport),
        coordinator.clone(),
        Arc::new(LocalFileSystem::new(options.download_dir.clone())),
        resolver,
    );

    let mut pending: VecDeque<DownloadItem> = VecDeque::new();
    for task in tasks {
        match store.find_by_url(&task.url) {
            Some(item) if item.status == ItemStatus::Completed => {
                let on_disk = item.final_path.as_ref().map_or(false, |p| p.exists());
                if on_disk {
                    view.println(format!(
                        "{:>25} Skipped {}",
                        HumanBytes(item.total_bytes).to_string(),
                        display_name(&item)
                    ));
                    continue;
                }
                pending.push_back(new_item(&task, &options));
            }
            Some(mut item) => {
                if task.hash.is_some() {
                    item.expected_checksum = task.hash.clone();
                }
                pending.push_back(item);
            }
            None => pending.push_back(new_item(&task, &options)),
        }
    }
    for item in &pending {
        store.upsert(item.clone());
    }

    let concurrency = options.concurrency.unwrap_or_else(num_cpus::get).max(1);
    let mut running: HashSet<ItemId> = HashSet::new();
    let mut failures = 0usize;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        while running.len() < concurrency {
            let Some(item) = pending.pop_front() else { break };
            running.insert(item.id);
            match item.status {
                ItemStatus::Paused | ItemStatus::Failed => engine.resume(&item).await,
                _ => engine.start(&item).await,
            }
        }
        if running.is_empty() {
            break;
        }

        tokio::select! {
            Some(item) = settled.recv() => {
                if running.remove(&item.id) && item.status == ItemStatus::Failed {
                    failures += 1;
                }
            }
            _ = &mut ctrl_c => {
                view.println("Interrupted, pausing downloads...".to_string());
                for id in engine.live_items().await {
                    if let Some(item) = coordinator.get_item(id) {
                        engine.pause(&item).await;
                    }
                }
                break;
            }
        }
    }

    saver.abort();
    store.save().await?;
    info!(failures, "run finished");
    if failures > 0 {
        bail!("{} download(s) failed", failures);
    }
    Ok(())
}

fn new_item(task: &Task, options: &RunOptions) -> DownloadItem {
    let mut item = DownloadItem::new(task.url.clone()).with_destination(options.download_dir.clone());
    item.expected_checksum = task.hash.clone();
    for (name, value) in &options.headers {
        item = item.with_header(name.clone(), value.clone());
    }
    item
}

pub async fn list_downloads(state_file: &Path) -> Result<()> {
    if !state_file.exists() {
        println!("No item list at {:?}.", state_file);
        println!("Tip: If you used a custom download directory, please specify it with --download-dir");
        return Ok(());
    }
    let store = ItemStore::load(state_file).await?;
    let items = store.all();

    let completed = items
        .iter()
        .filter(|i| i.status == ItemStatus::Completed)
        .count();
    let active = items
        .iter()
        .filter(|i| !i.status.is_terminal())
        .count();
    let received: u64 = items.iter().map(|i| i.received_bytes).sum();
    let known: u64 = items.iter().map(|i| i.total_bytes).sum();
    println!(
        "Summary: Files: {}/{} | Unfinished: {} | Downloaded: {} / {}",
        completed,
        items.len(),
        active,
        HumanBytes(received),
        HumanBytes(known)
    );
    println!();

    println!("{:<50} {:<15} {:<15} {:<15}", "Filename", "Status", "Progress", "Size");
    println!("{:-<50} {:-<15} {:-<15} {:-<15}", "", "", "", "");
    for item in &items {
        println!(
            "{:<50} {:<15} {:<15} {:<15}",
            display_name(item),
            format!("{:?}", item.status),
            format!("{:.2}%", item.progress() * 100.0),
            format!("{}", HumanBytes(item.total_bytes))
        );
        if let Some(err) = &item.last_error {
            println!("    {}", err);
        }
    }
    if items.is_empty() {
        println!("No downloads recorded in {:?}.", state_file);
    }
    Ok(())
}
