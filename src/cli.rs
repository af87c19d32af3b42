// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `stagehand`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Drive multi-stage batch calculations through an external queue.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workflow file (TOML).
    ///
    /// Default: `Stagehand.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Stagehand.toml")]
    pub config: String,

    /// Run a single tick cycle over every job, then exit.
    ///
    /// Useful from cron-like drivers; progress is recovered from checkpoints
    /// on the next invocation.
    #[arg(long)]
    pub once: bool,

    /// Seconds between tick cycles in the polling loop.
    ///
    /// Overrides `[settings].poll_interval_secs` from the workflow file.
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<u64>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `STAGEHAND_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print jobs and stages, but don't touch the queue.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
