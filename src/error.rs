use thiserror::Error;

/// Failures raised by a [`Transport`](crate::transport::Transport) call or its body stream.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("body stream failed: {0}")]
    Body(String),
    #[error("no data received for {0:?}")]
    Stalled(std::time::Duration),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_body() || error.is_decode() {
            Self::Body(error.to_string())
        } else {
            Self::Request(error.to_string())
        }
    }
}

/// Terminal item failures. The `Display` text is what ends up in `last_error`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error(
        "server ignored the byte range request for segment {segment}; \
         the download link may have expired, try refreshing it"
    )]
    RangeIgnored { segment: usize },
    #[error(
        "integrity check failed: server returned a mismatched byte range for segment {segment} \
         {count} times"
    )]
    RangeRejected { segment: usize, count: u32 },
    #[error("integrity check failed: expected {expected} bytes but the temp file holds {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("integrity check failed: temp file is missing")]
    TempFileMissing,
    #[error("segment {segment} failed after {attempts} attempts: {message}")]
    SegmentRetriesExhausted {
        segment: usize,
        attempts: u32,
        message: String,
    },
    #[error("download failed after {attempts} attempts: {message}")]
    StreamRetriesExhausted { attempts: u32, message: String },
    #[error("could not move the file into its destination: {0}")]
    Move(std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
