use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use mirrorsync::app::{App, Options};
use mirrorsync::config::Config;
use mirrorsync::db::{self, Database};
use mirrorsync::status::{OwnerId, SectionId};

#[derive(Parser, Debug)]
#[command(name = "mirrorsync")]
#[command(about = "Keeps a local mirror of a remote API fresh, one section at a time")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mirrorsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log filter, e.g. "debug" or "mirrorsync=trace" (default: $RUST_LOG or info)
  #[arg(long, global = true)]
  log_level: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Keep all sections fresh until Ctrl-C (default)
  Run {
    /// Use cached responses only, never touch the network
    #[arg(long)]
    offline: bool,

    /// Start without running any updates
    #[arg(long)]
    disable_updates: bool,
  },
  /// Refresh sections of one owner now
  Refresh {
    /// Section id (default: every section of the owner)
    section: Option<String>,

    /// Owner id (default: the global owner)
    #[arg(short, long)]
    owner: Option<i64>,

    /// Refresh even if the data is still fresh
    #[arg(short, long)]
    force: bool,

    /// Use cached responses only
    #[arg(long)]
    offline: bool,
  },
  /// Show section statuses
  Status {
    /// Only this owner
    #[arg(short, long)]
    owner: Option<i64>,
  },
  /// Remove all cached responses
  ClearCache,
  /// Print the directories in use
  Dirs,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_level.as_deref())?;

  let command = args.command.unwrap_or(Command::Run {
    offline: false,
    disable_updates: false,
  });

  if let Command::Dirs = command {
    println!("data:     {}", db::data_dir()?.display());
    println!("database: {}", Database::default_path()?.display());
    println!("logs:     {}", log_dir()?.display());
    if let Some(config_dir) = dirs::config_dir() {
      println!("config:   {}", config_dir.join("mirrorsync").display());
    }
    return Ok(());
  }

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  match command {
    Command::Run {
      offline,
      disable_updates,
    } => {
      let app = App::new(config, Options { offline })?;
      app.run(disable_updates).await?;
    }
    Command::Refresh {
      section,
      owner,
      force,
      offline,
    } => {
      let app = App::new(config, Options { offline })?;
      let owner = owner.map(OwnerId).unwrap_or(OwnerId::GLOBAL);
      let section = section.map(SectionId::new);
      for (section, changed) in app.refresh(owner, section.as_ref(), force).await? {
        println!("{}: {}", section, if changed { "changed" } else { "unchanged" });
      }
    }
    Command::Status { owner } => {
      let app = App::new(config, Options::default())?;
      println!("{}", app.status_report(owner.map(OwnerId)));
    }
    Command::ClearCache => {
      let app = App::new(config, Options::default())?;
      app.clear_cache()?;
    }
    Command::Dirs => {}
  }

  Ok(())
}

fn log_dir() -> Result<PathBuf> {
  Ok(db::data_dir()?.join("log"))
}

/// Log to stderr and to a daily rotated file in the data directory.
fn init_logging(level: Option<&str>) -> Result<WorkerGuard> {
  let dir = log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "mirrorsync.log"));

  let filter = match level {
    Some(level) => EnvFilter::try_new(level),
    None => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")),
  }
  .map_err(|e| eyre!("Invalid log level: {}", e))?;

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .init();

  Ok(guard)
}
