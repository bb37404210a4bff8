use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "startup-bench",
    about = "Measure how long interactive CLI versions take to become ready",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Append a JSON-lines execution log to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log: Option<PathBuf>,
}

/// Overrides shared by the benchmarking subcommands.
#[derive(Args, Debug, Clone, Default)]
pub struct BenchArgs {
    /// Trials per version (default: bench.samples from config)
    #[arg(long)]
    pub samples: Option<u32>,

    /// Per-trial timeout in milliseconds (default: bench.timeout_ms from config)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Working directory for the target (default: current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Benchmark interactive startup of one executable
    Run {
        /// Executable to start in a PTY
        executable: String,

        /// Version label for the report (default: the executable)
        #[arg(long)]
        label: Option<String>,

        #[command(flatten)]
        bench: BenchArgs,

        /// Arguments passed to the executable
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Benchmark several versions and report which reached the ready UI
    Suite {
        /// Version labels, resolved through [targets] then the install root
        #[arg(required = true)]
        versions: Vec<String>,

        /// Root directory holding one subdirectory per installed version
        #[arg(long)]
        install_root: Option<PathBuf>,

        /// Binary path inside each version directory
        #[arg(long)]
        binary: Option<PathBuf>,

        #[command(flatten)]
        bench: BenchArgs,
    },

    /// Time plain spawn-to-exit of an executable (no PTY)
    Spawn {
        executable: String,

        #[command(flatten)]
        bench: BenchArgs,

        /// Arguments passed to the executable
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Show the effective configuration
    Config {
        /// Print as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}
