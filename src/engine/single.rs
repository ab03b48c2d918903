use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::finalize::{commit_temp_file, complete_item};
use super::writer::OutputFile;
use super::{Command, EngineContext};
use crate::error::{EngineError, TransportError};
use crate::item::{DownloadItem, ItemStatus};
use crate::speed::SpeedMeter;
use crate::transport::{send_within, Method, Request};

enum Attempt {
    Complete,
    Retry(String),
    Paused,
    /// Canceled or failed; the item has already been reported.
    Exit,
}

/// Fallback for servers without usable range support: one progressive
/// stream into the temp file. Pausing drops the connection and keeps the
/// byte count, so a later resume asks for `bytes=<written>-`.
pub(crate) struct SingleStream {
    context: Arc<EngineContext>,
    item: DownloadItem,
    temp_path: PathBuf,
    written: u64,
    attempts: u32,
    meter: SpeedMeter,
    unreported: u64,
}

impl SingleStream {
    pub fn new(context: Arc<EngineContext>, item: DownloadItem) -> Self {
        let temp_path = context.temp_path(item.id);
        Self {
            context,
            item,
            temp_path,
            written: 0,
            attempts: 0,
            meter: SpeedMeter::new(0, Instant::now()),
            unreported: 0,
        }
    }

    pub async fn run(mut self, commands: &mut mpsc::Receiver<Command>) -> DownloadItem {
        self.item.supports_ranges = Some(false);
        let temp_len = match self.context.fs.file_len(&self.temp_path).await {
            Ok(len) => len.unwrap_or(0),
            Err(e) => return self.fail(EngineError::Io(e)),
        };
        // A segmented layout on disk is useless to a single stream.
        let resume_from = if self.item.segments.is_empty() {
            self.item.received_bytes.min(temp_len)
        } else {
            0
        };
        self.item.segments.clear();

        let mut output = match OutputFile::truncated(&self.temp_path, resume_from).await {
            Ok(output) => output,
            Err(e) => return self.fail(EngineError::Io(e)),
        };
        self.written = resume_from;
        self.item.received_bytes = resume_from;
        self.meter.rebase(resume_from, Instant::now());
        self.item.status = ItemStatus::Downloading;
        self.context.report(&mut self.item);
        info!(id = %self.item.id, resume_from, "single-stream download started");

        let mut delay = None;
        loop {
            match self.attempt(&mut output, commands, delay.take()).await {
                Attempt::Complete => return self.complete(output).await,
                Attempt::Retry(message) => {
                    self.attempts += 1;
                    if self.attempts > self.context.config.max_segment_retries {
                        let attempts = self.attempts;
                        return self.fail(EngineError::StreamRetriesExhausted { attempts, message });
                    }
                    let backoff = self.context.config.backoff(self.attempts);
                    warn!(
                        id = %self.item.id,
                        attempt = self.attempts,
                        delay = ?backoff,
                        error = %message,
                        "stream failed, retrying"
                    );
                    self.item.status = ItemStatus::Reconnecting;
                    self.item.last_error = Some(message);
                    self.context.report(&mut self.item);
                    delay = Some(backoff);
                }
                Attempt::Paused => {
                    if !self.wait_while_paused(commands, &mut output).await {
                        return self.item;
                    }
                }
                Attempt::Exit => return self.item,
            }
        }
    }

    async fn attempt(
        &mut self,
        output: &mut OutputFile,
        commands: &mut mpsc::Receiver<Command>,
        delay: Option<Duration>,
    ) -> Attempt {
        if let Some(delay) = delay {
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => {
                        if let Some(attempt) = self.on_command(command, output).await {
                            return attempt;
                        }
                    }
                }
            }
        }

        let mut request = Request::new(Method::Get, &self.item.url, &self.item.request_headers)
            .with_identity_encoding();
        if self.written > 0 {
            request = request.with_range(self.written, None);
        }
        let stall_timeout = self.context.config.stall_timeout;
        let transport = self.context.transport.clone();
        let sending = send_within(transport.as_ref(), request, stall_timeout);
        tokio::pin!(sending);
        let response = loop {
            tokio::select! {
                response = &mut sending => break response,
                command = commands.recv() => {
                    if let Some(attempt) = self.on_command(command, output).await {
                        return attempt;
                    }
                }
            }
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(e.to_string()),
        };

        match response.status {
            206 => {
                let range = response.content_range();
                if range.and_then(|r| r.start) != Some(self.written) {
                    if let Err(e) = self.restart_from_zero(output).await {
                        return self.fail_attempt(EngineError::Io(e));
                    }
                    return Attempt::Retry("server did not honor the resume offset".to_string());
                }
                if let Some(total) = range.and_then(|r| r.total) {
                    self.item.total_bytes = total;
                }
            }
            200 => {
                if self.written > 0 {
                    info!(id = %self.item.id, "server restarted the body, discarding partial data");
                    if let Err(e) = self.restart_from_zero(output).await {
                        return self.fail_attempt(EngineError::Io(e));
                    }
                }
                if let Some(length) = response.content_length() {
                    self.item.total_bytes = length;
                }
            }
            status => return Attempt::Retry(format!("unexpected HTTP status {}", status)),
        }
        if let Some(encoding) = response.foreign_content_encoding() {
            return Attempt::Retry(format!("server sent a {}-encoded body", encoding));
        }

        let total = Some(self.item.total_bytes).filter(|t| *t > 0);
        let mut body = response.body;
        loop {
            if total.map_or(false, |t| self.written >= t) {
                break;
            }
            let next = tokio::select! {
                next = tokio::time::timeout(stall_timeout, body.next()) => next,
                command = commands.recv() => {
                    if let Some(attempt) = self.on_command(command, output).await {
                        return attempt;
                    }
                    continue;
                }
            };
            let chunk = match next {
                Err(_) => return Attempt::Retry(TransportError::Stalled(stall_timeout).to_string()),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Attempt::Retry(e.to_string()),
                Ok(Some(Ok(chunk))) => chunk,
            };
            let take = match total {
                Some(t) => (t - self.written).min(chunk.len() as u64) as usize,
                None => chunk.len(),
            };
            if take == 0 {
                continue;
            }
            if let Err(e) = output.write_at(self.written, &chunk[..take]).await {
                return self.fail_attempt(EngineError::Io(e));
            }
            self.written += take as u64;
            self.unreported += take as u64;
            if self.item.status == ItemStatus::Reconnecting {
                self.item.status = ItemStatus::Downloading;
            }
            if self.unreported >= self.context.config.progress_report_bytes {
                self.unreported = 0;
                self.report_progress();
            }
        }

        if let Some(t) = total {
            if self.written < t {
                return Attempt::Retry(format!("stream ended at {} of {} bytes", self.written, t));
            }
        }
        Attempt::Complete
    }

    async fn restart_from_zero(&mut self, output: &mut OutputFile) -> std::io::Result<()> {
        output.set_len(0).await?;
        self.written = 0;
        self.item.received_bytes = 0;
        Ok(())
    }

    /// Applies a command that arrived mid-attempt. `None` means keep going.
    async fn on_command(&mut self, command: Option<Command>, output: &mut OutputFile) -> Option<Attempt> {
        match command {
            Some(Command::Resume(_)) => None,
            Some(Command::Pause(reply)) => {
                self.pause(output).await;
                let _ = reply.send(self.item.clone());
                Some(Attempt::Paused)
            }
            Some(Command::Cancel(reply)) => {
                self.cancel().await;
                let _ = reply.send(self.item.clone());
                Some(Attempt::Exit)
            }
            None => {
                self.pause(output).await;
                Some(Attempt::Exit)
            }
        }
    }

    /// Returns `true` when the item was resumed.
    async fn wait_while_paused(&mut self, commands: &mut mpsc::Receiver<Command>, output: &mut OutputFile) -> bool {
        loop {
            match commands.recv().await {
                Some(Command::Resume(_)) => {
                    self.item.status = ItemStatus::Downloading;
                    self.item.last_error = None;
                    self.meter.rebase(self.written, Instant::now());
                    self.context.report(&mut self.item);
                    info!(id = %self.item.id, offset = self.written, "resumed");
                    return true;
                }
                Some(Command::Pause(reply)) => {
                    let _ = reply.send(self.item.clone());
                }
                Some(Command::Cancel(reply)) => {
                    self.cancel().await;
                    let _ = reply.send(self.item.clone());
                    return false;
                }
                None => {
                    if let Err(e) = output.sync().await {
                        warn!(id = %self.item.id, error = %e, "flush failed");
                    }
                    return false;
                }
            }
        }
    }

    async fn pause(&mut self, output: &mut OutputFile) {
        if let Err(e) = output.sync().await {
            warn!(id = %self.item.id, error = %e, "flush on pause failed");
        }
        self.item.received_bytes = self.written;
        self.item.status = ItemStatus::Paused;
        self.item.speed = 0.0;
        self.item.eta_secs = None;
        self.context.report(&mut self.item);
        info!(id = %self.item.id, offset = self.written, "paused");
    }

    async fn cancel(&mut self) {
        if let Err(e) = self.context.fs.remove(&self.temp_path).await {
            warn!(id = %self.item.id, error = %e, "could not remove temp file");
        }
        self.item.status = ItemStatus::Canceled;
        self.item.speed = 0.0;
        self.item.eta_secs = None;
        self.context.report(&mut self.item);
        info!(id = %self.item.id, "canceled");
    }

    async fn complete(mut self, mut output: OutputFile) -> DownloadItem {
        if let Err(e) = output.sync().await {
            return self.fail(EngineError::Io(e));
        }
        drop(output);

        let expected = Some(self.item.total_bytes).filter(|t| *t > 0);
        debug!(id = %self.item.id, written = self.written, ?expected, "finalizing single stream");
        let final_path = match commit_temp_file(&self.temp_path, expected, &self.item, self.context.fs.as_ref()).await {
            Ok(path) => path,
            Err(e) => return self.fail(e),
        };
        self.item.total_bytes = self.written;
        self.item.received_bytes = self.written;
        let context = self.context.clone();
        complete_item(
            &mut self.item,
            final_path,
            context.coordinator.as_ref(),
            context.config.compute_checksum,
        )
        .await;
        self.item
    }

    fn report_progress(&mut self) {
        self.item.received_bytes = self.written;
        self.meter.record(self.written, Instant::now());
        self.item.speed = self.meter.speed();
        self.item.eta_secs = if self.item.total_bytes > 0 {
            self.meter
                .eta(self.item.total_bytes.saturating_sub(self.written))
                .map(|d| d.as_secs())
        } else {
            None
        };
        self.context.report(&mut self.item);
    }

    fn fail_attempt(&mut self, err: EngineError) -> Attempt {
        self.record_failure(err);
        Attempt::Exit
    }

    fn fail(mut self, err: EngineError) -> DownloadItem {
        self.record_failure(err);
        self.item
    }

    fn record_failure(&mut self, err: EngineError) {
        error!(id = %self.item.id, error = %err, "download failed");
        self.item.received_bytes = self.written;
        self.item.status = ItemStatus::Failed;
        self.item.last_error = Some(err.to_string());
        self.item.speed = 0.0;
        self.item.eta_secs = None;
        self.context.report(&mut self.item);
    }
}
