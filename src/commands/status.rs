//! `leasehold status`: what the ledger knows about one thread.
//!
//! Reads only; never wakes a paused sandbox. `--refresh` asks the provider
//! for the instance state first.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use super::{format_time, or_dash, Runtime};
use crate::manager::SessionSummary;
use crate::sandbox::Metrics;
use crate::store::{ObservedState, Terminal, TerminalCommand, ThreadPointer};

const RECENT_COMMANDS: usize = 5;

pub(crate) async fn run(runtime: &Runtime, thread_id: &str, refresh: bool) -> Result<()> {
    let manager = &runtime.manager;
    let summary = if refresh && manager.session(thread_id)?.is_some() {
        Some(manager.refresh_session(thread_id).await?)
    } else {
        manager.session(thread_id)?
    };
    let Some(summary) = summary else {
        println!("\n{} No active sandbox for thread {}.", "ℹ".blue(), thread_id);
        println!("  Run {} to create one.", format!("leasehold session get {thread_id}").green());
        return Ok(());
    };

    let pointer = manager.store().thread_pointer(thread_id)?;
    let terminal = manager.store().active_terminal(thread_id)?;
    let commands = match &terminal {
        Some(t) => manager.store().recent_commands(&t.terminal_id, RECENT_COMMANDS)?,
        None => Vec::new(),
    };
    let metrics = if summary.lease.observed_state == ObservedState::Running {
        manager.metrics(thread_id).await?
    } else {
        None
    };

    print!(
        "{}",
        format_status(
            &summary,
            pointer.as_ref(),
            terminal.as_ref(),
            &commands,
            metrics.as_ref()
        )
    );
    Ok(())
}

fn format_status(
    summary: &SessionSummary,
    pointer: Option<&ThreadPointer>,
    terminal: Option<&Terminal>,
    commands: &[TerminalCommand],
    metrics: Option<&Metrics>,
) -> String {
    let lease = &summary.lease;
    let mut out = String::new();
    let rule = "━".repeat(50).dimmed();

    writeln!(out, "\n{rule}").unwrap();
    writeln!(out, "{}", format!("   Thread {}", or_dash(summary.thread_id.as_deref())).yellow().bold()).unwrap();
    writeln!(out, "{rule}").unwrap();
    writeln!(out, "  Lease:      {}", lease.lease_id.cyan()).unwrap();
    writeln!(out, "  Provider:   {}", lease.provider_name.cyan()).unwrap();
    writeln!(out, "  Instance:   {}", or_dash(lease.current_instance_id.as_deref()).cyan()).unwrap();
    writeln!(out, "  Desired:    {}", lease.desired_state.to_string().cyan()).unwrap();
    let observed = lease.observed_state.to_string();
    let observed = if lease.is_converged() {
        observed.green()
    } else {
        observed.yellow()
    };
    writeln!(out, "  Observed:   {observed}").unwrap();
    writeln!(out, "  Version:    {}", lease.version).unwrap();
    if lease.needs_refresh {
        writeln!(out, "  Refresh:    {}", "pending".yellow()).unwrap();
    }
    if let Some(err) = &lease.last_error {
        writeln!(out, "  Last error: {}", err.red()).unwrap();
    }

    if let Some(chat) = &summary.chat {
        writeln!(out, "  Chat:       {} ({})", chat.chat_session_id, chat.status).unwrap();
        writeln!(out, "  Started:    {}", format_time(chat.started_at)).unwrap();
        writeln!(out, "  Active:     {}", format_time(chat.last_active_at)).unwrap();
    }

    if let Some(p) = pointer {
        if p.active_terminal_id == p.default_terminal_id {
            writeln!(out, "  Terminal:   {}", p.active_terminal_id).unwrap();
        } else {
            writeln!(
                out,
                "  Terminal:   {} (default {})",
                p.active_terminal_id, p.default_terminal_id
            )
            .unwrap();
        }
    }

    if let Some(terminal) = terminal {
        writeln!(out, "  Cwd:        {}", terminal.cwd.cyan()).unwrap();
        for (key, value) in &terminal.env_delta {
            writeln!(out, "  Env:        {key}={value}").unwrap();
        }
    }

    if let Some(m) = metrics {
        writeln!(
            out,
            "  CPU:        {}",
            or_dash(m.cpu_percent.map(|p| format!("{p:.1}%")))
        )
        .unwrap();
        writeln!(
            out,
            "  Memory:     {} / {}",
            or_dash(m.memory_bytes.map(format_bytes)),
            or_dash(m.memory_limit_bytes.map(format_bytes))
        )
        .unwrap();
    }

    if !commands.is_empty() {
        writeln!(out, "  Recent commands:").unwrap();
        for cmd in commands {
            writeln!(
                out,
                "    {} [{}] {}",
                format_time(cmd.created_at).dimmed(),
                or_dash(cmd.exit_code),
                cmd.command_line
            )
            .unwrap();
        }
    }
    writeln!(out, "{rule}").unwrap();
    out
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CommandStatus, DesiredState, Lease, LeaseStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn summary(last_error: Option<&str>) -> SessionSummary {
        SessionSummary {
            thread_id: Some("t1".to_string()),
            lease: Lease {
                lease_id: "lease-1".to_string(),
                provider_name: "docker".to_string(),
                workspace_key: Some("t1".to_string()),
                current_instance_id: Some("leasehold-abc".to_string()),
                instance_created_at: None,
                desired_state: DesiredState::Paused,
                observed_state: ObservedState::Unknown,
                version: 7,
                observed_at: None,
                last_error: last_error.map(String::from),
                needs_refresh: true,
                refresh_hint_at: None,
                status: LeaseStatus::Active,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            chat: None,
        }
    }

    #[test]
    fn test_format_status_lease_fields() {
        let out = format_status(&summary(Some("convergence timeout")), None, None, &[], None);
        assert!(out.contains("lease-1"));
        assert!(out.contains("leasehold-abc"));
        assert!(out.contains("paused"));
        assert!(out.contains("unknown"));
        assert!(out.contains("convergence timeout"));
        assert!(out.contains("Refresh"));
    }

    #[test]
    fn test_format_status_terminal_and_commands() {
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let terminal = Terminal {
            terminal_id: "term-1".to_string(),
            thread_id: "t1".to_string(),
            lease_id: "lease-1".to_string(),
            cwd: "/workspace/src".to_string(),
            env_delta: env,
            state_version: 2,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let command = TerminalCommand {
            command_id: "cmd-1".to_string(),
            terminal_id: "term-1".to_string(),
            chat_session_id: None,
            command_line: "cargo test".to_string(),
            cwd: "/workspace".to_string(),
            status: CommandStatus::Finished,
            stdout: None,
            stderr: None,
            exit_code: Some(101),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            finished_at: Some(Utc::now()),
        };
        let metrics = Metrics {
            cpu_percent: Some(12.5),
            memory_bytes: Some(512 * 1024 * 1024),
            ..Default::default()
        };
        let pointer = ThreadPointer {
            thread_id: "t1".to_string(),
            active_terminal_id: "term-1".to_string(),
            default_terminal_id: "term-0".to_string(),
            updated_at: Utc::now(),
        };
        let out = format_status(
            &summary(None),
            Some(&pointer),
            Some(&terminal),
            &[command],
            Some(&metrics),
        );
        assert!(out.contains("term-1 (default term-0)"));
        assert!(out.contains("/workspace/src"));
        assert!(out.contains("FOO=bar"));
        assert!(out.contains("[101] cargo test"));
        assert!(out.contains("12.5%"));
        assert!(out.contains("512.0 MiB"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(12), "12 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }
}
