use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    Auto,
    On,
    Off,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Single URL to download (optional, if provided, tasks-file is ignored)
    #[arg(index = 1)]
    pub url: Option<String>,

    /// Path to the file containing URLs (one per line, optionally `url|sha256`)
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    pub tasks_file: PathBuf,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Item list used to resume interrupted downloads (defaults to <download-dir>/.rangedl.json)
    #[arg(long = "state-file")]
    pub state_file: Option<PathBuf>,

    /// Maximum number of concurrent downloads (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    pub rate_limit: Option<u32>,

    /// Fixed number of segments per file (defaults to a size-based choice of 2 to 8)
    #[arg(short = 's', long)]
    pub split: Option<usize>,

    /// List all downloads and their status
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum, default_value = "auto")]
    pub verify_hash: VerifyMode,

    /// Program that prints a fresh media URL for a page URL (e.g. yt-dlp)
    #[arg(long)]
    pub resolver: Option<String>,

    /// Arguments for --resolver; `{url}` is replaced by the page URL
    #[arg(long = "resolver-arg", allow_hyphen_values = true)]
    pub resolver_args: Vec<String>,

    /// Seconds to wait for --resolver before giving up on a fresh URL
    #[arg(long = "resolver-timeout", default_value_t = 60)]
    pub resolver_timeout: u64,

    /// Host whose 401/403 answers mean the link expired (repeatable)
    #[arg(long = "refresh-host")]
    pub refresh_hosts: Vec<String>,

    /// Host that rejects HEAD requests (repeatable)
    #[arg(long = "head-reject-host")]
    pub head_reject_hosts: Vec<String>,

    /// Extra request header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,
}
