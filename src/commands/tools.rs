//! `leasehold env`, `leasehold fs ...` and `leasehold ps`: tool calls routed
//! through a thread's live sandbox.

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::fmt::Write as _;
use std::io::{Read, Write};

use super::Runtime;
use crate::sandbox::{FileEntry, ProcessInfo};

#[derive(Debug, Subcommand)]
pub(crate) enum FsCommand {
    /// Print a file (relative paths resolve against the terminal cwd)
    Read { thread_id: String, path: String },

    /// Write a file from CONTENT, or from stdin when omitted
    Write {
        thread_id: String,
        path: String,
        content: Option<String>,
    },

    /// List a directory
    Ls {
        thread_id: String,
        #[arg(default_value = ".")]
        path: String,
    },
}

pub(crate) async fn run_fs(runtime: &Runtime, command: FsCommand) -> Result<()> {
    let manager = &runtime.manager;
    match command {
        FsCommand::Read { thread_id, path } => {
            let bytes = manager.read_file(&thread_id, &path).await?;
            let mut stdout = std::io::stdout();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
        FsCommand::Write {
            thread_id,
            path,
            content,
        } => {
            let bytes = match content {
                Some(text) => text.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin()
                        .read_to_end(&mut buf)
                        .context("Failed to read stdin")?;
                    buf
                }
            };
            manager.write_file(&thread_id, &path, &bytes).await?;
            println!("{} Wrote {} bytes to {}", "✓".green(), bytes.len(), path.cyan());
        }
        FsCommand::Ls { thread_id, path } => {
            let entries = manager.list_dir(&thread_id, &path).await?;
            print!("{}", format_entries(&entries));
        }
    }
    Ok(())
}

/// `leasehold env <thread> KEY=VALUE`
pub(crate) async fn run_env(runtime: &Runtime, thread_id: &str, assignment: &str) -> Result<()> {
    let (key, value) = parse_assignment(assignment)?;
    runtime.manager.set_env(thread_id, key, value).await?;
    println!("{} {}={} exported for {}", "✓".green(), key.cyan(), value, thread_id);
    Ok(())
}

pub(crate) async fn run_ps(runtime: &Runtime, thread_id: &str) -> Result<()> {
    let processes = runtime.manager.processes(thread_id).await?;
    print!("{}", format_processes(processes.as_deref()));
    Ok(())
}

fn parse_assignment(assignment: &str) -> Result<(&str, &str)> {
    assignment
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{assignment}'"))
}

fn format_entries(entries: &[FileEntry]) -> String {
    let mut sorted: Vec<&FileEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    let mut out = String::new();
    for entry in sorted {
        if entry.is_dir {
            writeln!(out, "{:>10}  {}/", "-", entry.name.blue().bold()).unwrap();
        } else {
            writeln!(out, "{:>10}  {}", entry.size, entry.name).unwrap();
        }
    }
    out
}

fn format_processes(processes: Option<&[ProcessInfo]>) -> String {
    match processes {
        None => format!("{} Process listing is not supported by this provider\n", "ℹ".blue()),
        Some([]) => format!("{} No processes\n", "ℹ".blue()),
        Some(list) => {
            let mut out = String::new();
            for p in list {
                writeln!(out, "{:>8}  {}", p.pid, p.command).unwrap();
            }
            out
        }
    }
}
