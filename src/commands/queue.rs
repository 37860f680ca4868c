//! `leasehold queue ...`: direct access to the durable message queue.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::fmt::Write;

use super::{format_time, or_dash, Runtime};
use crate::queue::{QueueCounts, QueueMessage};

#[derive(Debug, Subcommand)]
pub(crate) enum QueueCommand {
    /// Append a JSON message
    Enqueue { queue: String, payload: String },

    /// Take the oldest pending message
    Claim { queue: String },

    /// Show one message by id
    Get { id: i64 },

    /// Mark a claimed message completed
    Complete { id: i64 },

    /// Mark a claimed message failed
    Fail { id: i64, error: String },

    /// Show pending messages without claiming them
    Peek {
        queue: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Per-status totals
    Counts { queue: String },
}

pub(crate) fn run(runtime: &Runtime, command: QueueCommand) -> Result<()> {
    let queue = &runtime.queue;
    match command {
        QueueCommand::Enqueue { queue: name, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload must be valid JSON")?;
            let id = queue.enqueue(&name, &payload)?;
            println!("{id}");
        }
        QueueCommand::Claim { queue: name } => match queue.claim(&name)? {
            Some(message) => println!("{}", serde_json::to_string(&message)?),
            None => eprintln!("{} Queue {} is empty", "ℹ".blue(), name),
        },
        QueueCommand::Get { id } => match queue.get(id)? {
            Some(message) => println!("{}", serde_json::to_string(&message)?),
            None => bail!("No message {id}"),
        },
        QueueCommand::Complete { id } => {
            if !queue.complete(id)? {
                bail!("Message {id} is not claimed");
            }
            println!("{} Message {} completed", "✓".green(), id);
        }
        QueueCommand::Fail { id, error } => {
            if !queue.fail(id, &error)? {
                bail!("Message {id} is not claimed");
            }
            println!("{} Message {} failed", "✓".green(), id);
        }
        QueueCommand::Peek { queue: name, limit } => {
            print!("{}", format_messages(&queue.peek(&name, limit)?));
        }
        QueueCommand::Counts { queue: name } => {
            print!("{}", format_counts(&name, &queue.counts(&name)?));
        }
    }
    Ok(())
}

fn format_messages(messages: &[QueueMessage]) -> String {
    if messages.is_empty() {
        return format!("{} No pending messages\n", "ℹ".blue());
    }
    let mut out = String::new();
    for m in messages {
        writeln!(
            out,
            "{:>6}  {}  {}  {}",
            m.id,
            format_time(m.created_at).dimmed(),
            or_dash(m.claimed_at.map(format_time)),
            m.payload
        )
        .unwrap();
    }
    out
}

fn format_counts(queue: &str, counts: &QueueCounts) -> String {
    format!(
        "{}: {} pending, {} claimed, {} completed, {} failed\n",
        queue.bold(),
        counts.pending,
        counts.claimed,
        counts.completed,
        counts.failed
    )
}
