//! `leasehold session ...`: lifecycle of one thread's sandbox.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use std::fmt::Write;

use super::{format_time, or_dash, Runtime};
use crate::manager::{CleanupReport, LifecycleOutcome, SessionSummary};
use crate::sandbox::SessionInfo;
use crate::store::ObservedState;
use crate::worker::LifecycleCommand;

#[derive(Debug, Subcommand)]
pub(crate) enum SessionCommand {
    /// Return the thread's running sandbox, creating or resuming it
    Get { thread_id: String },

    /// Pause the thread's sandbox
    Pause {
        thread_id: String,
        /// Enqueue for `serve` instead of acting now
        #[arg(long)]
        queued: bool,
    },

    /// Resume the thread's sandbox
    Resume {
        thread_id: String,
        /// Enqueue for `serve` instead of acting now
        #[arg(long)]
        queued: bool,
    },

    /// Destroy the thread's sandbox, persisting its data
    Destroy {
        thread_id: String,
        /// Enqueue for `serve` instead of acting now
        #[arg(long)]
        queued: bool,
    },

    /// List active leases
    List,

    /// Drop leases whose instance no longer exists
    Cleanup,

    /// Pause every running sandbox
    PauseAll,
}

pub(crate) async fn run(runtime: &Runtime, command: SessionCommand) -> Result<()> {
    let manager = &runtime.manager;
    match command {
        SessionCommand::Get { thread_id } => {
            let info = match manager.get_or_create_session(&thread_id).await {
                Ok(info) => info,
                Err(e) if e.is_not_converged() => {
                    eprintln!(
                        "{} The sandbox is still settling; retry {}",
                        "ℹ".blue(),
                        format!("leasehold session get {thread_id}").green()
                    );
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };
            print!("{}", format_session_info(&thread_id, &info));
        }
        SessionCommand::Pause { thread_id, queued } => {
            let command = LifecycleCommand::Pause { thread_id };
            if queued {
                enqueue(runtime, &command)?;
            } else {
                let outcome = manager.pause_session(command.thread_id()).await?;
                print!("{}", format_outcome("pause", command.thread_id(), &outcome));
            }
        }
        SessionCommand::Resume { thread_id, queued } => {
            let command = LifecycleCommand::Resume { thread_id };
            if queued {
                enqueue(runtime, &command)?;
            } else {
                let outcome = manager.resume_session(command.thread_id()).await?;
                print!("{}", format_outcome("resume", command.thread_id(), &outcome));
            }
        }
        SessionCommand::Destroy { thread_id, queued } => {
            let command = LifecycleCommand::Destroy { thread_id };
            if queued {
                enqueue(runtime, &command)?;
            } else {
                let outcome = manager.destroy_session(command.thread_id()).await?;
                print!("{}", format_outcome("destroy", command.thread_id(), &outcome));
            }
        }
        SessionCommand::List => {
            print!("{}", format_session_list(&manager.list_sessions()?));
        }
        SessionCommand::Cleanup => {
            let report = manager.cleanup_stale_sessions().await?;
            print!("{}", format_cleanup(&report));
        }
        SessionCommand::PauseAll => {
            let paused = manager.pause_all_sessions().await;
            println!("{} Paused {} sandbox(es)", "✓".green(), paused);
        }
    }
    Ok(())
}

fn enqueue(runtime: &Runtime, command: &LifecycleCommand) -> Result<()> {
    let id = command.enqueue(&runtime.queue)?;
    println!(
        "{} Queued message {} for thread {}",
        "→".blue(),
        id.to_string().cyan(),
        command.thread_id()
    );
    Ok(())
}

fn format_session_info(thread_id: &str, info: &SessionInfo) -> String {
    format!(
        "{} {} on {} for thread {} ({})\n",
        "✓".green().bold(),
        info.session_id.cyan(),
        info.provider,
        thread_id,
        info.status.to_string().green()
    )
}

fn format_outcome(action: &str, thread_id: &str, outcome: &LifecycleOutcome) -> String {
    if outcome.converged {
        format!(
            "{} {} {}: {}\n",
            "✓".green().bold(),
            action,
            thread_id,
            outcome.desired_state.to_string().green()
        )
    } else {
        format!(
            "{} {} {} accepted; provider has not confirmed {} yet\n",
            "…".yellow(),
            action,
            thread_id,
            outcome.desired_state.to_string().yellow()
        )
    }
}

fn colored_observed(state: ObservedState) -> String {
    let text = state.to_string();
    match state {
        ObservedState::Running => text.green().to_string(),
        ObservedState::Paused => text.yellow().to_string(),
        ObservedState::Destroyed => text.red().to_string(),
        ObservedState::Unknown => text.dimmed().to_string(),
    }
}

fn format_session_list(sessions: &[SessionSummary]) -> String {
    if sessions.is_empty() {
        return format!("{} No active sessions\n", "ℹ".blue());
    }
    let mut out = String::new();
    writeln!(
        out,
        "{:<20} {:<10} {:<26} {:<9} {:<10} {}",
        "THREAD", "PROVIDER", "INSTANCE", "DESIRED", "OBSERVED", "LAST ACTIVE"
    )
    .unwrap();
    for s in sessions {
        let lease = &s.lease;
        let refresh = if lease.needs_refresh { " *" } else { "" };
        writeln!(
            out,
            "{:<20} {:<10} {:<26} {:<9} {:<10} {}{}",
            or_dash(s.thread_id.as_deref()),
            lease.provider_name,
            or_dash(lease.current_instance_id.as_deref()),
            lease.desired_state.to_string(),
            colored_observed(lease.observed_state),
            or_dash(s.chat.as_ref().map(|c| format_time(c.last_active_at))),
            refresh
        )
        .unwrap();
    }
    if sessions.iter().any(|s| s.lease.needs_refresh) {
        writeln!(out, "{}", "* awaiting refresh from provider".dimmed()).unwrap();
    }
    out
}

fn format_cleanup(report: &CleanupReport) -> String {
    format!(
        "{} Checked {} lease(s): {} pruned, {} flagged for refresh\n",
        "✓".green(),
        report.checked,
        report.pruned,
        report.flagged
    )
}
