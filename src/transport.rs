use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{self, HeaderMap};
use reqwest::Client;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Head,
    Get,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

impl Request {
    pub fn new(method: Method, url: &str, headers: &BTreeMap<String, String>) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: headers.clone(),
        }
    }

    /// Adds `Range: bytes=<start>-<end>` (open-ended when `end` is `None`).
    pub fn with_range(mut self, start: u64, end: Option<u64>) -> Self {
        let value = match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        };
        self.set_header(header::RANGE.as_str(), value);
        self
    }

    /// Forces an uncompressed body so byte offsets line up with the file.
    pub fn with_identity_encoding(mut self) -> Self {
        self.set_header(header::ACCEPT_ENCODING.as_str(), "identity".to_string());
        self
    }

    /// Replaces every spelling of `name` already present.
    fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value);
    }

    pub fn range(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(header::RANGE.as_str()))
            .map(|(_, v)| v.as_str())
    }
}

pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        self.header(header::CONTENT_RANGE.as_str())
            .and_then(parse_content_range)
    }

    pub fn accepts_byte_ranges(&self) -> bool {
        self.header(header::ACCEPT_RANGES.as_str())
            .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
            .unwrap_or(false)
    }

    /// `None` when absent or `identity`, otherwise the declared coding.
    pub fn foreign_content_encoding(&self) -> Option<&str> {
        self.header(header::CONTENT_ENCODING.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("identity"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

/// Parses `bytes <start>-<end>/<total>`, where either side may be `*`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let (start, end) = match range.trim() {
        "*" => (None, None),
        r => {
            let (s, e) = r.split_once('-')?;
            (Some(s.trim().parse().ok()?), Some(e.trim().parse().ok()?))
        }
    };
    Some(ContentRange { start, end, total })
}

/// The HTTP capability the engine consumes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

/// Sends `request`, giving up when no response headers arrive within `limit`.
pub async fn send_within(
    transport: &dyn Transport,
    request: Request,
    limit: Duration,
) -> Result<Response, TransportError> {
    match tokio::time::timeout(limit, transport.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Stalled(limit)),
    }
}

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct ReqwestTransport {
    client: Client,
    rate_limiter: Option<(Arc<Limiter>, u32)>,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, rate_limit_bytes_per_sec: Option<u32>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let rate_limiter = rate_limit_bytes_per_sec
            .and_then(|limit| NonZeroU32::new(limit).map(|nz| (nz, limit)))
            .map(|(nz, limit)| (Arc::new(RateLimiter::direct(Quota::per_second(nz))), limit));

        Ok(Self {
            client,
            rate_limiter,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let method = match request.method {
            Method::Head => reqwest::Method::HEAD,
            Method::Get => reqwest::Method::GET,
        };
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let stream = response.bytes_stream().map_err(TransportError::from);

        let body: ByteStream = match &self.rate_limiter {
            Some((limiter, burst)) => {
                let limiter = limiter.clone();
                let burst = *burst;
                Box::pin(stream.then(move |chunk| {
                    let limiter = limiter.clone();
                    async move {
                        if let Ok(bytes) = &chunk {
                            let n = (bytes.len() as u64).min(burst as u64) as u32;
                            if let Some(n) = NonZeroU32::new(n) {
                                // n never exceeds the burst size, so this cannot fail
                                let _ = limiter.until_n_ready(n).await;
                            }
                        }
                        chunk
                    }
                }))
            }
            None => Box::pin(stream),
        };

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_range_forms() {
        assert_eq!(
            parse_content_range("bytes 0-0/1234"),
            Some(ContentRange {
                start: Some(0),
                end: Some(0),
                total: Some(1234)
            })
        );
        assert_eq!(
            parse_content_range("bytes 100-199/*"),
            Some(ContentRange {
                start: Some(100),
                end: Some(199),
                total: None
            })
        );
        assert_eq!(
            parse_content_range("bytes */5000"),
            Some(ContentRange {
                start: None,
                end: None,
                total: Some(5000)
            })
        );
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes 0-x/2"), None);
    }

    #[test]
    fn request_builds_range_and_encoding_headers() {
        let req = Request::new(Method::Get, "http://host/file", &BTreeMap::new())
            .with_range(10, Some(19))
            .with_identity_encoding();
        assert_eq!(req.range(), Some("bytes=10-19"));
        assert_eq!(req.headers.get("accept-encoding").map(String::as_str), Some("identity"));

        let open = Request::new(Method::Get, "http://host/file", &BTreeMap::new()).with_range(5, None);
        assert_eq!(open.range(), Some("bytes=5-"));
    }

    #[test]
    fn forced_headers_replace_caller_spellings() {
        let mut user = BTreeMap::new();
        user.insert("Accept-Encoding".to_string(), "gzip, br".to_string());
        user.insert("Range".to_string(), "bytes=0-".to_string());
        user.insert("Cookie".to_string(), "a=b".to_string());

        let req = Request::new(Method::Get, "http://host/file", &user)
            .with_range(5000, Some(9999))
            .with_identity_encoding();
        assert_eq!(req.range(), Some("bytes=5000-9999"));
        let mut expected = BTreeMap::new();
        expected.insert("Cookie".to_string(), "a=b".to_string());
        expected.insert("accept-encoding".to_string(), "identity".to_string());
        expected.insert("range".to_string(), "bytes=5000-9999".to_string());
        assert_eq!(req.headers, expected);
    }
}
