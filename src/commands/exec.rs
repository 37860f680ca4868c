//! `leasehold exec`: run a command in a thread's terminal.

use anyhow::{bail, Result};
use colored::Colorize;
use std::io::Write;

use super::Runtime;
use crate::manager::CommandOutcome;

/// Runs the command and returns its exit code.
pub(crate) async fn run(
    runtime: &Runtime,
    thread_id: &str,
    cwd: Option<&str>,
    timeout_ms: Option<u64>,
    command: &[String],
) -> Result<i32> {
    let command_line = join_command(command)?;
    let timeout_ms = timeout_ms.unwrap_or(runtime.config.session.exec_timeout_ms);

    let outcome = runtime
        .manager
        .execute(thread_id, &command_line, timeout_ms, cwd)
        .await?;

    print!("{}", outcome.result.output);
    std::io::stdout().flush()?;
    if let Some(stderr) = &outcome.result.error {
        eprint!("{stderr}");
    }
    eprintln!("{}", format_footer(&outcome));

    Ok(i32::try_from(outcome.result.exit_code).unwrap_or(1))
}

/// A single argument is passed through as a shell snippet; several are
/// quoted and joined.
fn join_command(command: &[String]) -> Result<String> {
    match command {
        [] => bail!("No command given"),
        [single] => Ok(single.clone()),
        many => Ok(shell_words::join(many)),
    }
}

fn format_footer(outcome: &CommandOutcome) -> String {
    let code = outcome.result.exit_code;
    let status = if code == 0 {
        format!("exit {code}").green()
    } else {
        format!("exit {code}").red()
    };
    format!(
        "{} {} · cwd {} · {}",
        "──".dimmed(),
        status,
        outcome.cwd.cyan(),
        outcome.command_id.dimmed()
    )
}
