use std::collections::BTreeMap;
use tracing::debug;

use crate::config::EngineConfig;
use crate::transport::{send_within, Method, Request, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeResult {
    pub supports_ranges: bool,
    pub total_bytes: u64,
    /// The host answered 401/403. Support is unknown rather than absent.
    pub access_denied: bool,
}

impl ProbeResult {
    fn ranged(total_bytes: u64) -> Self {
        Self {
            supports_ranges: true,
            total_bytes,
            access_denied: false,
        }
    }

    fn plain(total_bytes: u64) -> Self {
        Self {
            supports_ranges: false,
            total_bytes,
            access_denied: false,
        }
    }
}

fn is_access_denied(status: u16) -> bool {
    status == 401 || status == 403
}

/// Learns whether `url` can be fetched in byte ranges, and its size.
///
/// A HEAD request is tried first unless the host is known to reject it; a
/// one-byte ranged GET is the second opinion. Anything inconclusive comes
/// back as "no range support", which routes the item to single-stream mode.
pub async fn probe(
    transport: &dyn Transport,
    url: &str,
    headers: &BTreeMap<String, String>,
    config: &EngineConfig,
) -> ProbeResult {
    let mut known_length = 0;
    let mut head_denied = false;

    if !config.rejects_head(url) {
        let head = Request::new(Method::Head, url, headers);
        match send_within(transport, head, config.stall_timeout).await {
            Ok(resp) if is_access_denied(resp.status) => {
                debug!(url, status = resp.status, "HEAD denied");
                head_denied = true;
            }
            Ok(resp) if (200..300).contains(&resp.status) => {
                let length = resp.content_length().unwrap_or(0);
                if resp.accepts_byte_ranges() && length > 0 {
                    return ProbeResult::ranged(length);
                }
                known_length = length;
            }
            Ok(resp) => debug!(url, status = resp.status, "HEAD inconclusive"),
            Err(e) => debug!(url, error = %e, "HEAD failed"),
        }
    }

    let request = Request::new(Method::Get, url, headers)
        .with_range(0, Some(0))
        .with_identity_encoding();
    match send_within(transport, request, config.stall_timeout).await {
        Ok(resp) if resp.status == 206 => {
            match resp.content_range().and_then(|cr| cr.total).filter(|t| *t > 0) {
                Some(total) => ProbeResult::ranged(total),
                None => ProbeResult::plain(known_length),
            }
        }
        Ok(resp) if is_access_denied(resp.status) => {
            debug!(url, status = resp.status, "ranged probe denied");
            ProbeResult {
                access_denied: true,
                ..ProbeResult::plain(known_length)
            }
        }
        Ok(resp) if resp.status == 200 => {
            // Range header ignored; the whole body would follow.
            ProbeResult::plain(resp.content_length().unwrap_or(known_length))
        }
        Ok(resp) => {
            debug!(url, status = resp.status, "ranged probe inconclusive");
            ProbeResult {
                access_denied: head_denied,
                ..ProbeResult::plain(known_length)
            }
        }
        Err(e) => {
            debug!(url, error = %e, "ranged probe failed");
            ProbeResult {
                access_denied: head_denied,
                ..ProbeResult::plain(known_length)
            }
        }
    }
}
