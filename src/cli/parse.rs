//! CLI parse: clap types for crmsim. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// crmsim - drive simulated CRM activity over time
#[derive(Parser)]
#[command(name = "crmsim")]
#[command(about = "Plan and run CRM simulation jobs against a live or stub CRM")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Disable logging
    #[arg(long, short = 'q', default_value = "false")]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and summarize the plan for a simulation config, without running it
    Plan {
        /// Simulation config JSON (theme, industry, durationDays, recordDistribution)
        input: PathBuf,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Start a job and drive it until it finishes; Ctrl-C pauses it
    Run {
        /// Simulation config JSON
        input: PathBuf,
        /// Owner recorded on the job
        #[arg(long, default_value = "cli")]
        owner: String,
        /// Run against an in-memory CRM instead of the configured API
        #[arg(long)]
        dry_run: bool,
        /// Pacing override: immediate, real_time, or compressed:<factor>
        #[arg(long)]
        pacing: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Resume a paused or interrupted job and drive it until it finishes
    Resume {
        job_id: String,
        #[arg(long)]
        dry_run: bool,
        /// Pacing override: immediate, real_time, or compressed:<factor>
        #[arg(long)]
        pacing: Option<String>,
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Stop a job; pending steps are skipped
    Stop {
        job_id: String,
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show step counts for a job
    Status {
        job_id: String,
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List jobs, newest first
    Jobs {
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Print the effective configuration (access token redacted)
    Config {
        /// Output format (toml or json)
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Print a job's event log
    Events {
        job_id: String,
        /// Only events with a sequence number above this
        #[arg(long, default_value = "0")]
        after: u64,
        #[arg(long, default_value = "text")]
        format: String,
    },
}
