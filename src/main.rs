use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod error;
mod manager;
mod notifications;
mod orphans;
mod queue;
mod reaper;
mod reconcile;
mod sandbox;
mod store;
mod templates;
mod worker;

use commands::orphans::OrphansCommand;
use commands::queue::QueueCommand;
use commands::session::SessionCommand;
use commands::tools::FsCommand;
use commands::Runtime;
use config::{Config, CONFIG_FILE};

#[derive(Parser)]
#[command(name = "leasehold")]
#[command(
    author,
    version,
    about = "Lease, reconcile and reap ephemeral sandboxes for conversation threads"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./leasehold.toml)
    #[arg(long, global = true, env = "LEASEHOLD_CONFIG")]
    config: Option<PathBuf>,

    /// Provider for new leases (overrides LEASEHOLD_PROVIDER and config)
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Lease database (overrides [store].path)
    #[arg(long, global = true, env = "LEASEHOLD_DB")]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default leasehold.toml in the current directory
    Init {
        /// Force overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Manage a thread's sandbox
    #[command(subcommand)]
    Session(SessionCommand),

    /// Run a command in a thread's sandbox
    Exec {
        thread_id: String,

        /// Working directory for this command only
        #[arg(long)]
        cwd: Option<String>,

        /// Timeout in milliseconds (clamped by the provider)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Export a variable to every later command in a thread's terminal
    Env {
        thread_id: String,
        /// KEY=VALUE
        assignment: String,
    },

    /// Read, write and list files in a thread's sandbox
    #[command(subcommand)]
    Fs(FsCommand),

    /// List processes running in a thread's sandbox
    Ps { thread_id: String },

    /// Show what the lease store knows about a thread
    Status {
        thread_id: String,

        /// Re-read the instance state from the provider first
        #[arg(long)]
        refresh: bool,
    },

    /// Detect and resolve unmanaged provider instances
    #[command(subcommand)]
    Orphans(OrphansCommand),

    /// Inspect and drive the durable message queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Run the reaper, orphan detector and queue worker until Ctrl-C
    Serve,
}

/// Console logging plus an optional JSON file rotated daily.
fn init_logging(verbose: bool, file: Option<&str>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("leasehold=debug")
        } else {
            EnvFilter::new("leasehold=info")
        }
    });

    let (file_layer, guard) = match file {
        Some(path) => {
            let path = PathBuf::from(config::expand_path(path)?);
            let (dir, name) = split_log_path(&path)?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name: {}", path.display()))?
        .to_string();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    Ok((dir, name))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let config = Config::load(&config_path)?;
    let _guard = init_logging(cli.verbose, config.logging.file.as_deref())?;

    if let Commands::Init { force } = cli.command {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        commands::init::run(&cwd, force)?;
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = Runtime::open(config, cli.provider.as_deref(), cli.db)?;

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Session(command) => {
            commands::session::run(&runtime, command).await?;
        }
        Commands::Exec {
            thread_id,
            cwd,
            timeout_ms,
            command,
        } => {
            let code =
                commands::exec::run(&runtime, &thread_id, cwd.as_deref(), timeout_ms, &command)
                    .await?;
            return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)));
        }
        Commands::Env {
            thread_id,
            assignment,
        } => {
            commands::tools::run_env(&runtime, &thread_id, &assignment).await?;
        }
        Commands::Fs(command) => {
            commands::tools::run_fs(&runtime, command).await?;
        }
        Commands::Ps { thread_id } => {
            commands::tools::run_ps(&runtime, &thread_id).await?;
        }
        Commands::Status { thread_id, refresh } => {
            commands::status::run(&runtime, &thread_id, refresh).await?;
        }
        Commands::Orphans(command) => {
            commands::orphans::run(&runtime, command).await?;
        }
        Commands::Queue(command) => {
            commands::queue::run(&runtime, command)?;
        }
        Commands::Serve => {
            commands::serve::run(&runtime).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_exec() {
        let cli = Cli::try_parse_from([
            "leasehold", "exec", "t1", "--cwd", "src", "--", "ls", "-la",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec {
                thread_id,
                cwd,
                command,
                ..
            } => {
                assert_eq!(thread_id, "t1");
                assert_eq!(cwd.as_deref(), Some("src"));
                assert_eq!(command, vec!["ls", "-la"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from([
            "leasehold", "session", "list", "--provider", "docker", "--db", "/tmp/x.db",
        ])
        .unwrap();
        assert_eq!(cli.provider.as_deref(), Some("docker"));
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("/var/log/leasehold.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log"));
        assert_eq!(name, "leasehold.log");

        let (dir, name) = split_log_path(Path::new("leasehold.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "leasehold.log");
    }
}
