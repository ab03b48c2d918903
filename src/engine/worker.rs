use bytes::Bytes;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::transport::{send_within, Method, Request, Response, Transport};

/// Why a ranged response was refused before any body byte was used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// 200 for a request starting past byte zero: the range was ignored.
    RangeIgnored,
    /// 206 whose content range does not start where we asked.
    StartMismatch { expected: u64, actual: Option<u64> },
    /// Full-body answer to a range starting at zero.
    NotPartial(u16),
    Encoding(String),
    AccessDenied(u16),
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Chunk {
        index: usize,
        generation: u64,
        data: Bytes,
    },
    Rejected {
        index: usize,
        generation: u64,
        rejection: Rejection,
    },
    Finished {
        index: usize,
        generation: u64,
        error: Option<String>,
    },
}

/// One ranged fetch for the unreceived tail of a segment.
#[derive(Debug, Clone)]
pub(crate) struct FetchJob {
    pub index: usize,
    pub generation: u64,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub start: u64,
    pub end: u64,
    pub delay: Option<Duration>,
    pub stall_timeout: Duration,
}

enum Verdict {
    Accept,
    Reject(Rejection),
    Error(String),
}

fn validate(response: &Response, start: u64) -> Verdict {
    match response.status {
        206 => {}
        200 if start > 0 => return Verdict::Reject(Rejection::RangeIgnored),
        200 => return Verdict::Reject(Rejection::NotPartial(200)),
        401 | 403 => return Verdict::Reject(Rejection::AccessDenied(response.status)),
        status => return Verdict::Error(format!("unexpected HTTP status {}", status)),
    }

    let actual = response.content_range().and_then(|cr| cr.start);
    if actual != Some(start) {
        return Verdict::Reject(Rejection::StartMismatch {
            expected: start,
            actual,
        });
    }
    if let Some(encoding) = response.foreign_content_encoding() {
        return Verdict::Reject(Rejection::Encoding(encoding.to_string()));
    }
    Verdict::Accept
}

/// Runs `job` until its range is delivered, the stream fails, or `cancel` fires.
/// Nothing is sent after cancellation.
pub(crate) async fn run(
    job: FetchJob,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
) {
    let event = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        event = fetch(&job, transport.as_ref(), &events) => event,
    };
    if cancel.is_cancelled() {
        return;
    }
    let _ = events.send(event).await;
}

async fn fetch(job: &FetchJob, transport: &dyn Transport, events: &mpsc::Sender<WorkerEvent>) -> WorkerEvent {
    let finished = |error: Option<String>| WorkerEvent::Finished {
        index: job.index,
        generation: job.generation,
        error,
    };

    if let Some(delay) = job.delay {
        debug!(segment = job.index, ?delay, "waiting before retry");
        tokio::time::sleep(delay).await;
    }

    let request = Request::new(Method::Get, &job.url, &job.headers)
        .with_range(job.start, Some(job.end))
        .with_identity_encoding();
    let response = match send_within(transport, request, job.stall_timeout).await {
        Ok(response) => response,
        Err(e) => return finished(Some(e.to_string())),
    };

    match validate(&response, job.start) {
        Verdict::Accept => {}
        Verdict::Reject(rejection) => {
            debug!(segment = job.index, ?rejection, "response rejected");
            return WorkerEvent::Rejected {
                index: job.index,
                generation: job.generation,
                rejection,
            };
        }
        Verdict::Error(message) => return finished(Some(message)),
    }

    let mut remaining = job.end - job.start + 1;
    let mut body = response.body;
    while remaining > 0 {
        let next = match tokio::time::timeout(job.stall_timeout, body.next()).await {
            Ok(next) => next,
            Err(_) => return finished(Some(TransportError::Stalled(job.stall_timeout).to_string())),
        };
        match next {
            Some(Ok(mut chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if chunk.len() as u64 > remaining {
                    trace!(segment = job.index, extra = chunk.len() as u64 - remaining, "dropping overrun");
                    chunk.truncate(remaining as usize);
                }
                remaining -= chunk.len() as u64;
                let event = WorkerEvent::Chunk {
                    index: job.index,
                    generation: job.generation,
                    data: chunk,
                };
                if events.send(event).await.is_err() {
                    return finished(Some("session closed".to_string()));
                }
            }
            Some(Err(e)) => return finished(Some(e.to_string())),
            None => break,
        }
    }
    finished(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn response(status: u16, headers: &[(&'static str, &str)]) -> Response {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        Response {
            status,
            headers: map,
            body: Box::pin(stream::empty()),
        }
    }

    fn rejection(verdict: Verdict) -> Option<Rejection> {
        match verdict {
            Verdict::Reject(r) => Some(r),
            _ => None,
        }
    }

    #[test]
    fn accepts_matching_partial_content() {
        let resp = response(206, &[("content-range", "bytes 100-199/1000")]);
        assert!(matches!(validate(&resp, 100), Verdict::Accept));

        let resp = response(
            206,
            &[("content-range", "bytes 100-199/1000"), ("content-encoding", "identity")],
        );
        assert!(matches!(validate(&resp, 100), Verdict::Accept));
    }

    #[test]
    fn full_body_for_nonzero_start_means_range_ignored() {
        assert_eq!(rejection(validate(&response(200, &[]), 500)), Some(Rejection::RangeIgnored));
        assert_eq!(
            rejection(validate(&response(200, &[]), 0)),
            Some(Rejection::NotPartial(200))
        );
    }

    #[test]
    fn off_by_one_start_is_rejected() {
        let resp = response(206, &[("content-range", "bytes 101-199/1000")]);
        assert_eq!(
            rejection(validate(&resp, 100)),
            Some(Rejection::StartMismatch {
                expected: 100,
                actual: Some(101)
            })
        );
        assert_eq!(
            rejection(validate(&response(206, &[]), 100)),
            Some(Rejection::StartMismatch {
                expected: 100,
                actual: None
            })
        );
    }

    #[test]
    fn compressed_body_is_rejected() {
        let resp = response(
            206,
            &[("content-range", "bytes 0-9/10"), ("content-encoding", "gzip")],
        );
        assert_eq!(
            rejection(validate(&resp, 0)),
            Some(Rejection::Encoding("gzip".to_string()))
        );
    }

    #[test]
    fn denied_and_server_errors_are_classified() {
        assert_eq!(
            rejection(validate(&response(403, &[]), 0)),
            Some(Rejection::AccessDenied(403))
        );
        assert!(matches!(validate(&response(503, &[]), 0), Verdict::Error(_)));
    }
}
