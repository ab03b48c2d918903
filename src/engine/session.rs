use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::finalize::{finalize, FinalizeOutcome};
use super::worker::{self, FetchJob, Rejection, WorkerEvent};
use super::writer::OutputFile;
use super::{Command, EngineContext};
use crate::error::EngineError;
use crate::item::{DownloadItem, ItemStatus};
use crate::segment::{Segment, SegmentState};
use crate::speed::SpeedMeter;

const EVENT_BUFFER: usize = 64;

/// Ephemeral per-item download state. Lives only while the item is being
/// worked on and is rebuilt from the durable segments on resume.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub temp_path: PathBuf,
    pub total_bytes: u64,
    pub segments: Vec<Segment>,
    retries: Vec<u32>,
    range_rejects: Vec<u32>,
    ignored_ranges: Vec<u32>,
    generations: Vec<u64>,
    delivered: Vec<u64>,
    pub canceled: bool,
    pub finalized: bool,
    pub paused: bool,
}

impl SessionState {
    pub fn new(temp_path: PathBuf, total_bytes: u64, segments: Vec<Segment>) -> Self {
        let n = segments.len();
        Self {
            temp_path,
            total_bytes,
            segments,
            retries: vec![0; n],
            range_rejects: vec![0; n],
            ignored_ranges: vec![0; n],
            generations: vec![0; n],
            delivered: vec![0; n],
            canceled: false,
            finalized: false,
            paused: false,
        }
    }

    /// Where the next `len` delivered bytes for segment `index` go, and how
    /// many of them fit. Always computed from the current counter, never
    /// from a value captured when the request was issued.
    pub fn plan_write(&self, index: usize, len: usize) -> Option<(u64, usize)> {
        let seg = self.segments.get(index)?;
        let capacity = seg.remaining();
        if capacity == 0 || len == 0 {
            return None;
        }
        let take = (len as u64).min(capacity) as usize;
        Some((seg.next_offset(), take))
    }

    pub fn commit_write(&mut self, index: usize, written: usize) {
        if let Some(seg) = self.segments.get_mut(index) {
            seg.received = (seg.received + written as u64).min(seg.len());
            self.delivered[index] += written as u64;
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(Segment::is_complete)
    }

    pub fn received_total(&self) -> u64 {
        self.segments.iter().map(|s| s.received).sum()
    }

    pub fn reset_segment(&mut self, index: usize) {
        if let Some(seg) = self.segments.get_mut(index) {
            seg.received = 0;
            seg.state = SegmentState::Queued;
        }
    }

    /// Counts one refused range response for `index` and returns the new
    /// total. With `discard` the segment's received bytes are dropped too.
    pub fn record_range_reject(&mut self, index: usize, discard: bool) -> u32 {
        if discard {
            self.reset_segment(index);
        }
        self.range_rejects[index] += 1;
        self.range_rejects[index]
    }

    /// Takes the received counts of a durable snapshot when its boundaries
    /// match this session's layout. Returns whether they matched.
    pub fn sync_from(&mut self, durable: &[Segment]) -> bool {
        let same_layout = durable.len() == self.segments.len()
            && durable
                .iter()
                .zip(&self.segments)
                .all(|(d, s)| d.range_start == s.range_start && d.range_end == s.range_end);
        if !same_layout {
            return false;
        }
        for (seg, snapshot) in self.segments.iter_mut().zip(durable) {
            seg.received = snapshot.received.min(seg.len());
            seg.state = if seg.is_complete() {
                SegmentState::Done
            } else {
                SegmentState::Queued
            };
        }
        true
    }

    /// Drops the per-segment counters once the session is over.
    pub fn clear(&mut self) {
        self.retries.clear();
        self.range_rejects.clear();
        self.ignored_ranges.clear();
        self.generations.clear();
        self.delivered.clear();
    }

    fn accepts(&self, index: usize, generation: u64) -> bool {
        !self.canceled
            && !self.finalized
            && !self.paused
            && self.generations.get(index) == Some(&generation)
    }

    fn next_generation(&mut self, index: usize) -> u64 {
        self.generations[index] += 1;
        self.delivered[index] = 0;
        self.generations[index]
    }

    fn invalidate_workers(&mut self) {
        for generation in &mut self.generations {
            *generation += 1;
        }
    }
}

/// What to do about a segment whose stream has ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FinishAction {
    /// Everything arrived; a trailing error is irrelevant.
    Done,
    /// Clean end with bytes still missing: ask for the rest right away.
    Continue,
    Retry(String),
}

pub(crate) fn classify_finish(segment: &Segment, delivered: u64, error: Option<String>) -> FinishAction {
    if segment.is_complete() {
        return FinishAction::Done;
    }
    match error {
        Some(message) => FinishAction::Retry(message),
        None if delivered == 0 => FinishAction::Retry("stream ended without data".to_string()),
        None => FinishAction::Continue,
    }
}

pub(crate) enum SessionExit {
    Finished,
    RefreshUrl,
    SingleStream,
}

/// The per-item actor: the only place session state is mutated.
pub(crate) struct Session {
    context: Arc<EngineContext>,
    item: DownloadItem,
    state: SessionState,
    output: OutputFile,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    workers: CancellationToken,
    meter: SpeedMeter,
    unreported: Vec<u64>,
    resolver_attempted: bool,
}

impl Session {
    pub fn new(
        context: Arc<EngineContext>,
        item: DownloadItem,
        state: SessionState,
        output: OutputFile,
        resolver_attempted: bool,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let meter = SpeedMeter::new(state.received_total(), Instant::now());
        let unreported = vec![0; state.segments.len()];
        Self {
            context,
            item,
            state,
            output,
            events_tx,
            events_rx,
            workers: CancellationToken::new(),
            meter,
            unreported,
            resolver_attempted,
        }
    }

    pub async fn run(mut self, commands: &mut mpsc::Receiver<Command>) -> (SessionExit, DownloadItem) {
        self.item.status = ItemStatus::Downloading;
        self.report_progress();
        info!(
            id = %self.item.id,
            total = self.state.total_bytes,
            segments = self.state.segments.len(),
            received = self.state.received_total(),
            "segmented download started"
        );

        if let Some(exit) = self.launch_pending().await {
            return (exit, self.item);
        }

        loop {
            let exit = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.pause_now();
                        Some(SessionExit::Finished)
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            };
            if let Some(exit) = exit {
                return (exit, self.item);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Option<SessionExit> {
        match command {
            Command::Pause(reply) => {
                if !self.state.paused {
                    self.pause_now();
                }
                let _ = reply.send(self.item.clone());
                None
            }
            Command::Resume(durable) => {
                if !self.state.paused {
                    return None;
                }
                if !self.state.sync_from(&durable.segments) {
                    warn!(id = %self.item.id, "durable segments do not match the session layout");
                }
                self.state.paused = false;
                self.item.status = ItemStatus::Downloading;
                self.item.last_error = None;
                self.meter.rebase(self.state.received_total(), Instant::now());
                self.report_progress();
                info!(id = %self.item.id, received = self.state.received_total(), "resumed");
                self.launch_pending().await
            }
            Command::Cancel(reply) => {
                self.stop_workers();
                self.state.canceled = true;
                if let Err(e) = self.context.fs.remove(&self.state.temp_path).await {
                    warn!(id = %self.item.id, error = %e, "could not remove temp file");
                }
                self.item.status = ItemStatus::Canceled;
                self.item.speed = 0.0;
                self.item.eta_secs = None;
                self.report_progress();
                info!(id = %self.item.id, "canceled");
                let _ = reply.send(self.item.clone());
                Some(SessionExit::Finished)
            }
        }
    }

    /// Stops every worker and records progress. The snapshot is taken
    /// before the paused status is reported.
    fn pause_now(&mut self) {
        self.stop_workers();
        for seg in &mut self.state.segments {
            if !seg.is_complete() {
                seg.state = SegmentState::Queued;
            }
        }
        self.item.set_segments(&self.state.segments);
        self.state.paused = true;
        self.item.status = ItemStatus::Paused;
        self.item.speed = 0.0;
        self.item.eta_secs = None;
        self.context.report(&mut self.item);
        info!(id = %self.item.id, received = self.item.received_bytes, "paused");
    }

    async fn handle_event(&mut self, event: WorkerEvent) -> Option<SessionExit> {
        match event {
            WorkerEvent::Chunk {
                index,
                generation,
                data,
            } => {
                if !self.state.accepts(index, generation) {
                    return None;
                }
                let (offset, take) = self.state.plan_write(index, data.len())?;
                if let Err(e) = self.output.write_at(offset, &data[..take]).await {
                    return Some(self.fail(EngineError::Io(e)));
                }
                self.state.commit_write(index, take);
                self.unreported[index] += take as u64;
                if self.item.status == ItemStatus::Reconnecting {
                    self.item.status = ItemStatus::Downloading;
                }

                let complete = self.state.segments[index].is_complete();
                if complete {
                    self.state.segments[index].state = SegmentState::Done;
                    debug!(id = %self.item.id, segment = index, "segment complete");
                }
                if complete || self.unreported[index] >= self.context.config.progress_report_bytes {
                    self.unreported[index] = 0;
                    self.report_progress();
                }
                if complete {
                    return self.try_finalize().await;
                }
                None
            }
            WorkerEvent::Finished {
                index,
                generation,
                error,
            } => {
                if !self.state.accepts(index, generation) {
                    return None;
                }
                self.handle_finished(index, error).await
            }
            WorkerEvent::Rejected {
                index,
                generation,
                rejection,
            } => {
                if !self.state.accepts(index, generation) {
                    return None;
                }
                self.handle_rejection(index, rejection).await
            }
        }
    }

    async fn handle_finished(&mut self, index: usize, error: Option<String>) -> Option<SessionExit> {
        let action = classify_finish(
            &self.state.segments[index],
            self.state.delivered[index],
            error,
        );
        match action {
            FinishAction::Done => {
                self.state.segments[index].state = SegmentState::Done;
                self.try_finalize().await
            }
            FinishAction::Continue => {
                debug!(id = %self.item.id, segment = index, "stream ended early, requesting the rest");
                self.launch(index, None);
                None
            }
            FinishAction::Retry(message) => {
                self.state.retries[index] += 1;
                let attempt = self.state.retries[index];
                if attempt > self.context.config.max_segment_retries {
                    self.state.segments[index].state = SegmentState::Failed;
                    return Some(self.fail(EngineError::SegmentRetriesExhausted {
                        segment: index,
                        attempts: attempt,
                        message,
                    }));
                }
                let delay = self.context.config.backoff(attempt);
                warn!(
                    id = %self.item.id,
                    segment = index,
                    attempt,
                    ?delay,
                    error = %message,
                    "segment failed, retrying"
                );
                self.item.status = ItemStatus::Reconnecting;
                self.item.last_error = Some(message);
                self.report_progress();
                self.launch(index, Some(delay));
                None
            }
        }
    }

    async fn handle_rejection(&mut self, index: usize, rejection: Rejection) -> Option<SessionExit> {
        let context = self.context.clone();
        let config = &context.config;
        match rejection {
            Rejection::RangeIgnored => {
                self.state.ignored_ranges[index] += 1;
                let count = self.state.ignored_ranges[index];
                warn!(id = %self.item.id, segment = index, count, "server ignored range request");
                if count >= config.max_ignored_ranges {
                    return Some(self.fail(EngineError::RangeIgnored { segment: index }));
                }
                let delay = config.backoff(count);
                self.launch(index, Some(delay));
                None
            }
            Rejection::StartMismatch { .. } | Rejection::NotPartial(_) | Rejection::Encoding(_) => {
                // bytes counted so far can no longer be trusted
                let discard = !matches!(rejection, Rejection::Encoding(_));
                let count = self.state.record_range_reject(index, discard);
                warn!(id = %self.item.id, segment = index, count, ?rejection, "range response rejected");
                if count >= config.max_range_rejects {
                    self.state.segments[index].state = SegmentState::Failed;
                    return Some(self.fail(EngineError::RangeRejected {
                        segment: index,
                        count,
                    }));
                }
                self.report_progress();
                self.launch(index, None);
                None
            }
            Rejection::AccessDenied(status) => {
                if !config.requires_refresh(&self.item.url) {
                    return self
                        .handle_finished(index, Some(format!("access denied (HTTP {})", status)))
                        .await;
                }
                self.stop_workers();
                self.item.set_segments(&self.state.segments);
                let exit = if self.resolver_attempted {
                    warn!(id = %self.item.id, status, "access still denied, switching to single stream");
                    SessionExit::SingleStream
                } else {
                    info!(id = %self.item.id, status, "access denied, refreshing url");
                    SessionExit::RefreshUrl
                };
                if let Err(e) = self.output.sync().await {
                    warn!(id = %self.item.id, error = %e, "flush before restart failed");
                }
                Some(exit)
            }
        }
    }

    fn launch(&mut self, index: usize, delay: Option<Duration>) {
        let generation = self.state.next_generation(index);
        let seg = &mut self.state.segments[index];
        seg.state = SegmentState::Downloading;
        let job = FetchJob {
            index,
            generation,
            url: self.item.url.clone(),
            headers: self.item.request_headers.clone(),
            start: seg.next_offset(),
            end: seg.range_end,
            delay,
            stall_timeout: self.context.config.stall_timeout,
        };
        debug!(id = %self.item.id, segment = index, start = job.start, end = job.end, "launching worker");
        tokio::spawn(worker::run(
            job,
            self.context.transport.clone(),
            self.events_tx.clone(),
            self.workers.child_token(),
        ));
    }

    async fn launch_pending(&mut self) -> Option<SessionExit> {
        let pending: Vec<usize> = self
            .state
            .segments
            .iter()
            .filter(|s| !s.is_complete())
            .map(|s| s.index)
            .collect();
        if pending.is_empty() {
            return self.try_finalize().await;
        }
        for index in pending {
            self.launch(index, None);
        }
        None
    }

    fn stop_workers(&mut self) {
        self.workers.cancel();
        self.workers = CancellationToken::new();
        self.state.invalidate_workers();
    }

    async fn try_finalize(&mut self) -> Option<SessionExit> {
        if !self.state.is_complete() || self.state.canceled {
            return None;
        }
        self.stop_workers();
        if let Err(e) = self.output.sync().await {
            return Some(self.fail(EngineError::Io(e)));
        }
        let context = self.context.clone();
        let result = finalize(
            &mut self.state,
            &mut self.item,
            context.fs.as_ref(),
            context.coordinator.as_ref(),
            context.config.compute_checksum,
        )
        .await;
        match result {
            Ok(FinalizeOutcome::NotReady) => None,
            Ok(FinalizeOutcome::AlreadyFinalized) | Ok(FinalizeOutcome::Completed(_)) => {
                Some(SessionExit::Finished)
            }
            Err(e) => Some(self.fail(e)),
        }
    }

    /// Terminal failure. The temp file stays on disk.
    fn fail(&mut self, err: EngineError) -> SessionExit {
        self.stop_workers();
        self.state.canceled = true;
        error!(id = %self.item.id, error = %err, "download failed");
        self.item.set_segments(&self.state.segments);
        self.item.status = ItemStatus::Failed;
        self.item.last_error = Some(err.to_string());
        self.item.speed = 0.0;
        self.item.eta_secs = None;
        self.context.report(&mut self.item);
        SessionExit::Finished
    }

    fn report_progress(&mut self) {
        let received = self.state.received_total();
        self.item.set_segments(&self.state.segments);
        self.meter.record(received, Instant::now());
        self.item.speed = self.meter.speed();
        self.item.eta_secs = self
            .meter
            .eta(self.state.total_bytes.saturating_sub(received))
            .map(|d| d.as_secs());
        self.context.report(&mut self.item);
    }
}
