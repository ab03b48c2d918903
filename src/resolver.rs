use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Produces a fresh, signed URL for a page whose media link expired.
/// Best effort: `None` means no fresh link could be obtained.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve_fresh_url(&self, page_url: &str, headers: &BTreeMap<String, String>) -> Option<String>;
}

pub struct NoResolver;

#[async_trait]
impl UrlResolver for NoResolver {
    async fn resolve_fresh_url(&self, _page_url: &str, _headers: &BTreeMap<String, String>) -> Option<String> {
        None
    }
}

/// Runs an external program (for example `yt-dlp -g {url}`) and takes the
/// first URL it prints.
pub struct CommandResolver {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandResolver {
    /// `{url}` in `args` is replaced by the page URL; when no argument
    /// contains it, the URL is appended.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_args(&self, page_url: &str, headers: &BTreeMap<String, String>) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + headers.len() * 2 + 1);
        for (name, value) in headers {
            args.push("--add-header".to_string());
            args.push(format!("{}:{}", name, value));
        }
        let mut substituted = false;
        for arg in &self.args {
            if arg.contains("{url}") {
                substituted = true;
                args.push(arg.replace("{url}", page_url));
            } else {
                args.push(arg.clone());
            }
        }
        if !substituted {
            args.push(page_url.to_string());
        }
        args
    }
}

fn first_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("http://") || line.starts_with("https://"))
        .map(str::to_string)
}

#[async_trait]
impl UrlResolver for CommandResolver {
    async fn resolve_fresh_url(&self, page_url: &str, headers: &BTreeMap<String, String>) -> Option<String> {
        let args = self.build_args(page_url, headers);
        debug!(program = %self.program, ?args, "resolving fresh url");

        let run = Command::new(&self.program).args(&args).kill_on_drop(true).output();
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(program = %self.program, error = %e, "resolver failed to start");
                return None;
            }
            Err(_) => {
                warn!(program = %self.program, "resolver timed out");
                return None;
            }
        };
        if !output.status.success() {
            warn!(program = %self.program, status = %output.status, "resolver exited with failure");
            return None;
        }
        first_url(&String::from_utf8_lossy(&output.stdout))
    }
}
