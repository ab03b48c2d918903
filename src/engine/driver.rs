use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::session::{Session, SessionExit, SessionState};
use super::single::SingleStream;
use super::writer::OutputFile;
use super::{Command, EngineContext};
use crate::error::EngineError;
use crate::item::{DownloadItem, ItemStatus};
use crate::probe::probe;
use crate::segment::plan_segments;

enum Step {
    Done,
    RefreshUrl,
    SingleStream,
}

/// Carries one item from probing to a terminal or paused state.
pub(crate) struct Driver {
    context: Arc<EngineContext>,
    item: DownloadItem,
    commands: mpsc::Receiver<Command>,
    resolver_attempted: bool,
}

impl Driver {
    pub fn new(context: Arc<EngineContext>, item: DownloadItem, commands: mpsc::Receiver<Command>) -> Self {
        Self {
            context,
            item,
            commands,
            resolver_attempted: false,
        }
    }

    pub async fn run(mut self) {
        let mut single = false;
        loop {
            let step = if single {
                self.run_single().await
            } else {
                self.run_probed().await
            };
            match step {
                Step::Done => return,
                Step::SingleStream => single = true,
                Step::RefreshUrl => {
                    self.resolver_attempted = true;
                    let page = self.item.page_url.clone().unwrap_or_else(|| self.item.url.clone());
                    let fresh = self
                        .context
                        .resolver
                        .resolve_fresh_url(&page, &self.item.request_headers)
                        .await;
                    match fresh {
                        Some(url) => {
                            info!(id = %self.item.id, "restarting with a fresh url");
                            self.item.url = url;
                        }
                        None => {
                            warn!(id = %self.item.id, "no fresh url, falling back to a single stream");
                            single = true;
                        }
                    }
                }
            }
        }
    }

    async fn run_probed(&mut self) -> Step {
        self.item.status = ItemStatus::Probing;
        self.item.last_error = None;
        self.context.report(&mut self.item);

        let context = self.context.clone();
        let url = self.item.url.clone();
        let headers = self.item.request_headers.clone();
        let probing = probe(context.transport.as_ref(), &url, &headers, &context.config);
        tokio::pin!(probing);

        let result = loop {
            tokio::select! {
                result = &mut probing => break result,
                command = self.commands.recv() => match command {
                    Some(Command::Resume(_)) => continue,
                    Some(Command::Pause(reply)) => {
                        self.item.status = ItemStatus::Paused;
                        self.context.report(&mut self.item);
                        let _ = reply.send(self.item.clone());
                        return Step::Done;
                    }
                    Some(Command::Cancel(reply)) => {
                        self.cancel().await;
                        let _ = reply.send(self.item.clone());
                        return Step::Done;
                    }
                    None => return Step::Done,
                },
            }
        };
        debug!(id = %self.item.id, ?result, "probe finished");

        if result.access_denied && !self.resolver_attempted && context.config.requires_refresh(&url) {
            return Step::RefreshUrl;
        }
        if !result.supports_ranges {
            if result.total_bytes > 0 {
                self.item.total_bytes = result.total_bytes;
            }
            return Step::SingleStream;
        }

        self.item.supports_ranges = Some(true);
        let temp_path = context.temp_path(self.item.id);
        let total = result.total_bytes;
        let mut plan = plan_segments(
            &self.item.segments,
            self.item.total_bytes,
            total,
            context.config.segment_count_override,
        );

        if plan.reused {
            match context.fs.file_len(&temp_path).await {
                Ok(Some(len)) if len == total => {}
                Ok(found) => {
                    warn!(id = %self.item.id, ?found, "temp file unusable, restarting from zero");
                    plan = plan_segments(&[], 0, total, context.config.segment_count_override);
                }
                Err(e) => return self.fail(EngineError::Io(e)),
            }
        }
        if !plan.reused {
            if let Err(e) = context.fs.remove(&temp_path).await {
                return self.fail(EngineError::Io(e));
            }
        }

        self.item.total_bytes = total;
        self.item.set_segments(&plan.segments);
        if let Err(e) = context.fs.preallocate(&temp_path, total).await {
            return self.fail(EngineError::Io(e));
        }
        let output = match OutputFile::open(&temp_path).await {
            Ok(output) => output,
            Err(e) => return self.fail(EngineError::Io(e)),
        };

        let state = SessionState::new(temp_path, total, plan.segments);
        let session = Session::new(
            context.clone(),
            self.item.clone(),
            state,
            output,
            self.resolver_attempted,
        );
        let (exit, item) = session.run(&mut self.commands).await;
        self.item = item;
        match exit {
            SessionExit::Finished => Step::Done,
            SessionExit::RefreshUrl => Step::RefreshUrl,
            SessionExit::SingleStream => Step::SingleStream,
        }
    }

    async fn run_single(&mut self) -> Step {
        let stream = SingleStream::new(self.context.clone(), self.item.clone());
        self.item = stream.run(&mut self.commands).await;
        Step::Done
    }

    async fn cancel(&mut self) {
        if let Err(e) = self.context.fs.remove(&self.context.temp_path(self.item.id)).await {
            warn!(id = %self.item.id, error = %e, "could not remove temp file");
        }
        self.item.status = ItemStatus::Canceled;
        self.context.report(&mut self.item);
    }

    fn fail(&mut self, err: EngineError) -> Step {
        error!(id = %self.item.id, error = %err, "download failed");
        self.item.status = ItemStatus::Failed;
        self.item.last_error = Some(err.to_string());
        self.item.speed = 0.0;
        self.item.eta_secs = None;
        self.context.report(&mut self.item);
        Step::Done
    }
}
