mod cache;
mod commands;
mod config;
mod db;
mod http;
mod net;
mod page;
mod reset;
mod session;
mod surface;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::{CategoryArg, Profile, WorkerAction};

#[derive(Parser, Debug)]
#[command(name = "nope")]
#[command(about = "Offline cache and session reset layer for the NOPE journal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/nope/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Clear every persistence surface now and print the counts
  Reset,
  /// Show what each persistence surface holds
  Profile {
    /// Fill every page-reachable surface with sample state first
    #[arg(long)]
    seed: bool,
  },
  /// Run the page-load reset check for a page at URL
  Check {
    url: String,
    /// Run the check a page does when it becomes visible again
    #[arg(long)]
    visible: bool,
  },
  /// Route one request through the worker's fetch policy
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    #[arg(short, long)]
    accept: Option<String>,
  },
  /// Drive the worker lifecycle or send it a control message
  Worker {
    #[arg(value_enum)]
    action: WorkerAction,
  },
  /// Post a raw control message, e.g. '{"type":"CLEAR_CACHE"}' or GET_VERSION
  Message { payload: String },
  /// Log in, registering USERNAME on first use
  Login { username: String },
  /// Drop the session pointer, keeping the user's data
  Logout,
  /// Show the current session and count today's activity
  Session,
  /// Save a rant for the logged-in user
  Rant {
    text: String,
    #[arg(short, long, value_enum, default_value = "personal-pain")]
    category: CategoryArg,
  },
  /// Save an artefak, subject to the upload cooldown
  Artefak { title: String },
}

fn init_logging(data_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::never(data_dir, "nope.log"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(stderr)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _guard = init_logging(&data_dir, args.verbose)?;

  let profile = Profile::open(config, &data_dir)?;

  match args.command {
    Command::Reset => commands::reset(&profile).await,
    Command::Profile { seed } => commands::profile(&profile, seed).await,
    Command::Check { url, visible } => commands::check(&profile, &url, visible).await,
    Command::Fetch {
      url,
      method,
      accept,
    } => commands::fetch(&profile, &url, &method, accept).await,
    Command::Worker { action } => commands::worker(&profile, action).await,
    Command::Message { payload } => commands::message(&profile, &payload).await,
    Command::Login { username } => commands::login(&profile, &username),
    Command::Logout => commands::logout(&profile),
    Command::Session => commands::session(&profile),
    Command::Rant { text, category } => commands::rant(&profile, &text, category),
    Command::Artefak { title } => commands::artefak(&profile, &title),
  }
}
