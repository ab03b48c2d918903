//! Resumable multi-connection downloads.
//!
//! [`Engine`] splits a resource into byte-range segments, fetches them
//! concurrently into one preallocated temp file, survives pause, cancel and
//! process restarts through the durable segment list on each
//! [`DownloadItem`], and moves the verified file into place at the end.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fs;
pub mod hashing;
pub mod item;
pub mod probe;
pub mod resolver;
pub mod segment;
pub mod speed;
pub mod transport;
pub mod utils;

pub use config::EngineConfig;
pub use coordinator::Coordinator;
pub use engine::Engine;
pub use error::{EngineError, TransportError};
pub use fs::{FileSystem, LocalFileSystem};
pub use item::{DownloadItem, ItemId, ItemStatus};
pub use resolver::{CommandResolver, NoResolver, UrlResolver};
pub use segment::{Segment, SegmentState};
pub use transport::{ReqwestTransport, Transport};
