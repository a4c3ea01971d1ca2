//! sessync CLI - session sync client.

use clap::{Parser, Subcommand};
use sessync::cli;
use sessync::cli::queue::QueueAction;
use sessync::config::{Config, load_config};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Get the version string.
///
/// - Release builds (on a git tag): "0.1.2"
/// - Development builds: "0.1.2-dev (abc1234)"
/// - Dirty working directory: "0.1.2-dev (abc1234-dirty)"
fn version() -> &'static str {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    const GIT_HASH: &str = env!("SESSYNC_GIT_HASH");
    const IS_RELEASE: &str = env!("SESSYNC_IS_RELEASE");

    static VERSION_STRING: std::sync::OnceLock<String> = std::sync::OnceLock::new();

    VERSION_STRING.get_or_init(|| {
        if IS_RELEASE == "true" {
            VERSION.to_string()
        } else {
            format!("{VERSION}-dev ({GIT_HASH})")
        }
    })
}

#[derive(Parser)]
#[command(name = "sessync")]
#[command(author, version = version(), about = "Session sync client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cached sessions.
    List {
        /// Maximum number of sessions to show. Defaults to 20.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Include soft-deleted sessions.
        #[arg(short, long)]
        all: bool,
    },

    /// Show a session's cached messages.
    History {
        /// Session ID.
        session_id: String,

        /// Only show the newest N messages.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Show full message text instead of the first line.
        #[arg(short, long)]
        full: bool,
    },

    /// Show or edit the send queue and the priority queue.
    Queue {
        #[command(subcommand)]
        action: Option<QueueAction>,
    },

    /// Trim a session's cached messages.
    Prune {
        /// Session ID.
        session_id: String,

        /// Keep exactly this many of the newest messages. Defaults to the
        /// configured retention policy.
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// Delete a session.
    Delete {
        /// Session ID.
        session_id: String,

        /// Remove the record and its messages instead of hiding it.
        #[arg(long)]
        purge: bool,
    },

    /// Connect to the backend and keep sessions in sync until interrupted.
    Connect {
        /// Backend websocket URL. Overrides the configured one.
        #[arg(long)]
        url: Option<String>,

        /// Session to follow; may be repeated.
        #[arg(short, long = "session")]
        sessions: Vec<String>,
    },
}

/// Install the stderr log subscriber.
///
/// `SESSYNC_LOG` takes precedence over the configured level.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_env("SESSYNC_LOG")
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sessync: error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    let result = match cli.command {
        Commands::List { limit, all } => cli::list::run(&config, limit, all),
        Commands::History {
            session_id,
            limit,
            full,
        } => cli::history::run(&config, &session_id, limit, full),
        Commands::Queue { action } => cli::queue::run(&config, action),
        Commands::Prune { session_id, keep } => cli::prune::run(&config, &session_id, keep),
        Commands::Delete { session_id, purge } => cli::delete::run(&config, &session_id, purge),
        Commands::Connect { url, sessions } => cli::connect::run(&config, url.as_deref(), &sessions),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sessync: error: {e}");
            ExitCode::FAILURE
        }
    }
}
