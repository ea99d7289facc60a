/// Command-line and environment configuration.
///
/// Every setting can come from a flag or a `CAREQUEUE_*` variable; a
/// `.env` file in the working directory is read before parsing.

use crate::day::{parse_time_of_day, DayScope};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use chrono::NaiveTime;
use std::net::SocketAddr;
use std::path::PathBuf;

/// carequeue - hospital token queue service
#[derive(Debug, Parser)]
#[command(name = "carequeue")]
#[command(about = "Per-hospital patient tokens with a live counter and daily reset")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub settings: Settings,

    /// Verbosity level
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the HTTP service and the daily reset (default)
    Serve,
    /// Walk through a short registration and calling session in memory
    Demo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// Everything is lost on restart
    Memory,
    /// sled database under --data-dir
    Sled,
}

#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Address the HTTP service listens on
    #[arg(long, env = "CAREQUEUE_BIND", default_value = "127.0.0.1:10000", global = true)]
    pub bind: SocketAddr,

    /// Storage backend
    #[arg(long, env = "CAREQUEUE_STORAGE", value_enum, default_value_t = StorageKind::Memory, global = true)]
    pub storage: StorageKind,

    /// Directory for the sled database
    #[arg(long, env = "CAREQUEUE_DATA_DIR", default_value = "carequeue-data", global = true)]
    pub data_dir: PathBuf,

    /// Local wall time (HH:MM) at which counters reset every day
    #[arg(long, env = "CAREQUEUE_RESET_AT", default_value = "00:00", value_parser = parse_time_of_day, global = true)]
    pub reset_at: NaiveTime,

    /// Fixed UTC offset that defines the queue's calendar day
    #[arg(
        long,
        env = "CAREQUEUE_UTC_OFFSET",
        default_value = "+05:30",
        value_parser = DayScope::parse_offset,
        allow_hyphen_values = true,
        global = true
    )]
    pub utc_offset: DayScope,
}

impl Cli {
    /// Load `.env` (if present) and parse the process arguments.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Cli::parse()
    }

    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Serve)
    }

    /// Default tracing filter for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "carequeue=info,tower_http=warn",
            1 => "carequeue=debug,tower_http=info",
            2 => "debug",
            _ => "trace",
        }
    }
}
