//! `leasehold orphans ...`: find and explicitly dispose of unmanaged instances.

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;
use std::fmt::Write;
use std::time::Duration;

use super::{format_time, Runtime};
use crate::notifications::Notifier;
use crate::orphans::{OrphanDetector, OrphanReport};

#[derive(Debug, Subcommand)]
pub(crate) enum OrphansCommand {
    /// Compare provider accounts against the lease store
    Scan,

    /// Destroy an instance no lease knows about
    Destroy {
        provider: String,
        instance_id: String,
        /// Confirm the destruction
        #[arg(long)]
        yes: bool,
    },

    /// Bind an unmanaged instance to a thread
    Adopt {
        provider: String,
        instance_id: String,
        thread_id: String,
    },
}

pub(crate) async fn run(runtime: &Runtime, command: OrphansCommand) -> Result<()> {
    let detector = OrphanDetector::new(
        runtime.manager.clone(),
        Notifier::new(runtime.config.notifications.clone()),
        Duration::from_secs(runtime.config.orphans.interval_secs),
    );
    match command {
        OrphansCommand::Scan => {
            let reports = detector.scan().await?;
            print!("{}", format_reports(&reports));
        }
        OrphansCommand::Destroy {
            provider,
            instance_id,
            yes,
        } => {
            if !yes {
                bail!("Refusing to destroy {instance_id} without --yes");
            }
            if detector.destroy_orphan(&provider, &instance_id).await? {
                println!("{} Destroyed {} on {}", "✓".green(), instance_id.cyan(), provider);
            } else {
                println!("{} {} was already gone", "ℹ".blue(), instance_id);
            }
        }
        OrphansCommand::Adopt {
            provider,
            instance_id,
            thread_id,
        } => {
            let lease = detector
                .adopt_orphan(&provider, &instance_id, &thread_id)
                .await?;
            println!(
                "{} Thread {} now owns {} (lease {})",
                "✓".green(),
                thread_id,
                instance_id.cyan(),
                lease.lease_id
            );
        }
    }
    Ok(())
}

fn format_reports(reports: &[OrphanReport]) -> String {
    let mut out = String::new();
    for report in reports {
        if report.is_clean() {
            writeln!(out, "{} {}: in sync", "✓".green(), report.provider).unwrap();
            continue;
        }
        writeln!(out, "{} {}:", "!".yellow().bold(), report.provider.bold()).unwrap();
        for orphan in &report.orphans {
            let created = orphan
                .created_at
                .map_or_else(|| "unknown".to_string(), format_time);
            writeln!(
                out,
                "  {} {} ({}, created {})",
                "orphan ".red(),
                orphan.instance_id,
                orphan.status,
                created
            )
            .unwrap();
        }
        for (lease_id, instance_id) in &report.missing {
            writeln!(
                out,
                "  {} {} (lease {}, flagged for refresh)",
                "missing".yellow(),
                instance_id,
                lease_id
            )
            .unwrap();
        }
    }
    if reports.iter().any(|r| !r.orphans.is_empty()) {
        writeln!(
            out,
            "\nUse {} or {} to resolve orphans.",
            "orphans destroy".green(),
            "orphans adopt".green()
        )
        .unwrap();
    }
    out
}
