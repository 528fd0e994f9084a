//! CLI argument parsing for calltrack

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{ConfigError, TrackerConfig};

/// Output format for captured events
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "calltrack")]
#[command(version)]
#[command(about = "Call and object lifecycle tracker with safe concurrent shutdown", long_about = None)]
pub struct Cli {
    /// Initial interning table capacity (0 = default; overrides CALLTRACK_INTERN_CAPACITY)
    #[arg(long = "intern-capacity", value_name = "N", global = true)]
    pub intern_capacity: Option<usize>,

    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Also write captured events to FILE as JSON lines
    #[arg(short = 'o', long = "output", value_name = "FILE", global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Trace a short scripted program and print every event
    Demo,
    /// Dispatch from many threads and stop the session while they run
    Stress {
        /// Number of producer threads
        #[arg(long, default_value_t = 8)]
        threads: usize,

        /// Events dispatched by each thread
        #[arg(long, default_value_t = 1000)]
        events: usize,

        /// Milliseconds to wait after start before stopping
        #[arg(long = "stop-after-ms", value_name = "MS", default_value_t = 5)]
        stop_after_ms: u64,
    },
}

impl Cli {
    /// Tracker configuration from `--intern-capacity`, falling back to the
    /// environment.
    pub fn tracker_config(&self) -> Result<TrackerConfig, ConfigError> {
        match self.intern_capacity {
            Some(n) => TrackerConfig::new(n),
            None => TrackerConfig::from_env(),
        }
    }
}
