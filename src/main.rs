mod cli;
mod commands;
mod store;

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::cli::Args;
use crate::commands::{RunOptions, Task};

fn main() -> Result<()> {
    let mut args = Args::parse();

    // Logs share stderr with the progress bars, so default to warnings only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Only if we are NOT in single URL mode (tasks_file is unused then)
    if args.url.is_none() {
        if let Ok(abs_input) = std::fs::canonicalize(&args.tasks_file) {
            args.tasks_file = abs_input;
        }
    }
    // Output dir might not exist yet, so we resolve it relative to current dir
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }
    let state_file = args
        .state_file
        .clone()
        .unwrap_or_else(|| args.download_dir.join(".rangedl.json"));

    let rt = tokio::runtime::Runtime::new()?;
    if args.list {
        return rt.block_on(commands::list_downloads(&state_file));
    }

    let headers = args
        .headers
        .iter()
        .map(|raw| commands::parse_header(raw))
        .collect::<Result<Vec<_>>>()?;
    let options = RunOptions {
        download_dir: args.download_dir.clone(),
        state_file,
        concurrency: args.concurrency,
        rate_limit: args.rate_limit,
        split: args.split,
        verify_mode: args.verify_hash.clone(),
        resolver: args
            .resolver
            .clone()
            .map(|program| (program, args.resolver_args.clone())),
        resolver_timeout: Duration::from_secs(args.resolver_timeout),
        refresh_hosts: args.refresh_hosts.clone(),
        head_reject_hosts: args.head_reject_hosts.clone(),
        headers,
    };

    rt.block_on(async {
        let tasks = match args.url {
            Some(url) => vec![Task { url, hash: None }],
            None => commands::read_tasks_file(&args.tasks_file).await?,
        };
        commands::run_downloads(tasks, options).await
    })
}
