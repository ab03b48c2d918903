#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use rangedl::error::TransportError;
use rangedl::transport::{ByteStream, Method, Request, Response, Transport};
use rangedl::{
    Coordinator, DownloadItem, Engine, EngineConfig, FileSystem, ItemId, ItemStatus,
    LocalFileSystem, NoResolver, UrlResolver,
};
use reqwest::header::{HeaderMap, HeaderValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic content so misplaced bytes show up in comparisons.
pub fn sample_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[derive(Debug, Clone)]
pub struct Behavior {
    pub ranges: bool,
    /// Added to the start reported in `Content-Range` for body requests.
    pub range_start_skew: u64,
    /// Answer 200 with the full body whenever a range starts past zero.
    pub ignore_nonzero_ranges: bool,
    /// Body requests that fail before any byte is sent.
    pub fail_requests: usize,
    /// Body requests that never get response headers.
    pub hang_requests: usize,
    /// Every request that never gets response headers, probes included.
    pub hang_all: bool,
    /// `Content-Encoding` sent with ranged body responses.
    pub content_encoding: Option<String>,
    /// Body responses that end cleanly after half of what was asked.
    pub short_responses: usize,
    /// Append an error after the last byte of every body.
    pub trailing_error: bool,
    pub chunk_size: usize,
    pub chunk_delay: Option<Duration>,
    pub denied_urls: HashSet<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            ranges: true,
            range_start_skew: 0,
            ignore_nonzero_ranges: false,
            fail_requests: 0,
            hang_requests: 0,
            hang_all: false,
            content_encoding: None,
            short_responses: 0,
            trailing_error: false,
            chunk_size: 4096,
            chunk_delay: None,
            denied_urls: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub method: Method,
    pub url: String,
    pub range: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// In-memory HTTP server serving one body under any URL.
pub struct MockServer {
    body: Bytes,
    behavior: Mutex<Behavior>,
    seen: Mutex<Vec<Seen>>,
}

impl MockServer {
    pub fn new(body: Vec<u8>, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            body: Bytes::from(body),
            behavior: Mutex::new(behavior),
            seen: Mutex::new(vec![]),
        })
    }

    pub fn update(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.behavior.lock().unwrap());
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    /// Ranges of body requests (everything except probes).
    pub fn body_ranges(&self) -> Vec<String> {
        self.seen()
            .into_iter()
            .filter(|s| s.method == Method::Get && s.range.as_deref() != Some("bytes=0-0"))
            .map(|s| s.range.unwrap_or_default())
            .collect()
    }

    fn respond(status: u16, headers: &[(&'static str, String)], body: ByteStream) -> Response {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        Response {
            status,
            headers: map,
            body,
        }
    }

    fn stream(&self, data: Bytes, behavior: &Behavior) -> ByteStream {
        let chunk_size = behavior.chunk_size.max(1);
        let delay = behavior.chunk_delay;
        let chunks: Vec<Result<Bytes, TransportError>> = (0..data.len())
            .step_by(chunk_size)
            .map(|at| Ok(data.slice(at..(at + chunk_size).min(data.len()))))
            .chain(
                behavior
                    .trailing_error
                    .then(|| Err(TransportError::Body("connection reset".to_string()))),
            )
            .collect();
        stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
            .boxed()
    }
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() { None } else { Some(end.parse().ok()?) };
    Some((start, end))
}

#[async_trait]
impl Transport for MockServer {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let range = request.range().map(str::to_string);
        self.seen.lock().unwrap().push(Seen {
            method: request.method,
            url: request.url.clone(),
            range: range.clone(),
            headers: request.headers.clone(),
        });

        let is_probe = request.method == Method::Head || range.as_deref() == Some("bytes=0-0");
        let hang = {
            let mut behavior = self.behavior.lock().unwrap();
            let hang = behavior.hang_all || (!is_probe && behavior.hang_requests > 0);
            if hang && !behavior.hang_all {
                behavior.hang_requests -= 1;
            }
            hang
        };
        if hang {
            futures::future::pending::<()>().await;
        }

        let mut behavior = self.behavior.lock().unwrap();
        let total = self.body.len() as u64;
        if behavior.denied_urls.contains(&request.url) {
            return Ok(Self::respond(403, &[], stream::empty().boxed()));
        }

        if request.method == Method::Head {
            let mut headers = vec![("content-length", total.to_string())];
            if behavior.ranges {
                headers.push(("accept-ranges", "bytes".to_string()));
            }
            return Ok(Self::respond(200, &headers, stream::empty().boxed()));
        }

        if !is_probe && behavior.fail_requests > 0 {
            behavior.fail_requests -= 1;
            return Err(TransportError::Request("connection refused".to_string()));
        }

        let parsed = range.as_deref().and_then(parse_range);
        let honor = behavior.ranges
            && parsed.is_some()
            && !(behavior.ignore_nonzero_ranges && parsed.map_or(false, |(s, _)| s > 0));
        match parsed.filter(|_| honor) {
            Some((start, end)) => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                let mut data = self.body.slice(start as usize..=end as usize);
                if !is_probe && behavior.short_responses > 0 {
                    behavior.short_responses -= 1;
                    data = data.slice(..data.len() / 2);
                }
                let reported = if is_probe { start } else { start + behavior.range_start_skew };
                let mut headers = vec![(
                    "content-range",
                    format!("bytes {}-{}/{}", reported, end, total),
                )];
                if let Some(encoding) = behavior.content_encoding.clone().filter(|_| !is_probe) {
                    headers.push(("content-encoding", encoding));
                }
                let body = self.stream(data, &behavior);
                Ok(Self::respond(206, &headers, body))
            }
            None => {
                let headers = [("content-length", total.to_string())];
                let body = self.stream(self.body.clone(), &behavior);
                Ok(Self::respond(200, &headers, body))
            }
        }
    }
}

/// Keeps the latest record of every item plus the full report history.
#[derive(Default)]
pub struct RecordingCoordinator {
    items: Mutex<HashMap<ItemId, DownloadItem>>,
    history: Mutex<Vec<DownloadItem>>,
}

impl RecordingCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn latest(&self, id: ItemId) -> Option<DownloadItem> {
        self.items.lock().unwrap().get(&id).cloned()
    }

    pub fn history(&self, id: ItemId) -> Vec<DownloadItem> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.id == id)
            .cloned()
            .collect()
    }

    /// Polls until `pred` holds for the latest record of `id`.
    pub async fn wait_for(&self, id: ItemId, pred: impl Fn(&DownloadItem) -> bool) -> DownloadItem {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(item) = self.latest(id) {
                if pred(&item) {
                    return item;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting on item {}: {:?}", id, self.latest(id));
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    pub async fn wait_status(&self, id: ItemId, status: ItemStatus) -> DownloadItem {
        self.wait_for(id, |item| item.status == status).await
    }

    pub async fn wait_settled(&self, id: ItemId) -> DownloadItem {
        self.wait_for(id, |item| item.status.is_terminal()).await
    }
}

impl Coordinator for RecordingCoordinator {
    fn get_item(&self, id: ItemId) -> Option<DownloadItem> {
        self.latest(id)
    }

    fn report_progress(&self, item: DownloadItem) {
        self.history.lock().unwrap().push(item.clone());
        self.items.lock().unwrap().insert(item.id, item);
    }
}

/// Local filesystem that can misreport lengths and counts moves.
pub struct TestFs {
    inner: LocalFileSystem,
    pub reported_len: Mutex<Option<u64>>,
    pub moves: AtomicUsize,
}

impl TestFs {
    pub fn new(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalFileSystem::new(dir),
            reported_len: Mutex::new(None),
            moves: AtomicUsize::new(0),
        })
    }

    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileSystem for TestFs {
    async fn preallocate(&self, path: &Path, size: u64) -> io::Result<()> {
        self.inner.preallocate(path, size).await
    }

    async fn move_into_destination(
        &self,
        temp_path: &Path,
        suggested_name: &str,
        preferred_dir: Option<&Path>,
    ) -> io::Result<PathBuf> {
        self.moves.fetch_add(1, Ordering::SeqCst);
        self.inner
            .move_into_destination(temp_path, suggested_name, preferred_dir)
            .await
    }

    async fn file_len(&self, path: &Path) -> io::Result<Option<u64>> {
        let reported = *self.reported_len.lock().unwrap();
        match reported {
            Some(len) => Ok(Some(len)),
            None => self.inner.file_len(path).await,
        }
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path).await
    }
}

/// Hands out one fixed URL and counts the calls.
pub struct FixedResolver {
    pub url: Option<String>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl UrlResolver for FixedResolver {
    async fn resolve_fresh_url(&self, _page_url: &str, _headers: &BTreeMap<String, String>) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.url.clone()
    }
}

pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        temp_dir: dir.join("tmp"),
        backoff_unit: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(20),
        progress_report_bytes: 4096,
        stall_timeout: Duration::from_secs(2),
        compute_checksum: false,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub server: Arc<MockServer>,
    pub coordinator: Arc<RecordingCoordinator>,
    pub fs: Arc<TestFs>,
    pub engine: Engine,
}

impl Harness {
    pub fn new(body: Vec<u8>, behavior: Behavior) -> Self {
        Self::with(body, behavior, |_| {}, Arc::new(NoResolver))
    }

    pub fn with(
        body: Vec<u8>,
        behavior: Behavior,
        tune: impl FnOnce(&mut EngineConfig),
        resolver: Arc<dyn UrlResolver>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tune(&mut config);
        let server = MockServer::new(body, behavior);
        let coordinator = RecordingCoordinator::new();
        let fs = TestFs::new(&dir.path().join("out"));
        let engine = Engine::new(config, server.clone(), coordinator.clone(), fs.clone(), resolver);
        Self {
            dir,
            server,
            coordinator,
            fs,
            engine,
        }
    }

    pub fn out_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn item(&self, name: &str) -> DownloadItem {
        DownloadItem::new(format!("http://files.test/{}", name)).with_destination(self.out_dir())
    }
}
