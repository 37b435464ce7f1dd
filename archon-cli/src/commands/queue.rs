//! `speckit-archon queue` — request queue inspection.

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use archon_core::{Concern, FeatureId, Settings};
use archon_sync::RequestQueue;

use crate::parse_feature;

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Show pending, in-flight and dead-lettered requests.
    List {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
    /// Move a dead-lettered request back to pending with a fresh retry budget.
    Requeue {
        #[arg(value_parser = parse_feature)]
        feature: FeatureId,
        /// init, doc-sync, task-sync or status-pull.
        concern: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SlotState {
    Pending,
    Inflight,
    DeadLetter,
}

impl SlotState {
    fn label(self) -> &'static str {
        match self {
            SlotState::Pending => "pending",
            SlotState::Inflight => "in-flight",
            SlotState::DeadLetter => "dead-letter",
        }
    }
}

#[derive(Debug, Serialize)]
struct QueueRow {
    feature: FeatureId,
    concern: Concern,
    state: SlotState,
    attempts: u32,
    next_attempt_at: String,
    last_error: String,
}

#[derive(Tabled)]
struct QueueTableRow {
    #[tabled(rename = "Feature")]
    feature: String,
    #[tabled(rename = "Concern")]
    concern: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Next attempt")]
    next_attempt_at: String,
    #[tabled(rename = "Last error")]
    last_error: String,
}

pub fn run(command: QueueCommand, settings: &Settings) -> Result<()> {
    let queue = RequestQueue::new(&settings.state_root);

    match command {
        QueueCommand::List { json } => {
            let rows = collect_rows(&queue)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows).context("failed to render queue JSON")?
                );
            } else if rows.is_empty() {
                println!("queue is empty");
            } else {
                print_table(rows);
            }
        }
        QueueCommand::Requeue { feature, concern } => {
            let concern = Concern::from_slot_name(&concern).ok_or_else(|| {
                anyhow!(
                    "unknown concern '{concern}'; expected: init, doc-sync, task-sync, status-pull"
                )
            })?;
            let moved = queue
                .requeue(&feature, concern)
                .with_context(|| format!("failed to requeue {feature}/{concern}"))?;
            if moved {
                println!("requeued {feature}/{concern}");
            } else {
                println!("no dead-lettered request for {feature}/{concern}");
            }
        }
    }

    Ok(())
}

fn collect_rows(queue: &RequestQueue) -> Result<Vec<QueueRow>> {
    let mut rows = Vec::new();
    let slots = [
        (SlotState::Pending, queue.list_pending()),
        (SlotState::Inflight, queue.list_inflight()),
        (SlotState::DeadLetter, queue.list_dead_letters()),
    ];
    for (state, listed) in slots {
        let listed = listed.with_context(|| format!("failed to list {} requests", state.label()))?;
        for (feature, concern) in listed {
            let retry = queue
                .retry_state(&feature, concern)
                .with_context(|| format!("failed to read retry state for {feature}/{concern}"))?;
            let (attempts, next_attempt_at, last_error) = match retry {
                Some(retry) => (retry.attempts, retry.next_attempt_at, retry.last_error),
                None => (0, String::new(), String::new()),
            };
            rows.push(QueueRow {
                feature,
                concern,
                state,
                attempts,
                next_attempt_at,
                last_error,
            });
        }
    }
    Ok(rows)
}

fn print_table(rows: Vec<QueueRow>) {
    let table_rows: Vec<QueueTableRow> = rows
        .into_iter()
        .map(|row| QueueTableRow {
            feature: row.feature.to_string(),
            concern: row.concern.to_string(),
            state: colorize_state(row.state),
            attempts: row.attempts,
            next_attempt_at: dash_if_empty(row.next_attempt_at),
            last_error: dash_if_empty(row.last_error),
        })
        .collect();

    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn colorize_state(state: SlotState) -> String {
    match state {
        SlotState::Pending => state.label().green().to_string(),
        SlotState::Inflight => state.label().yellow().to_string(),
        SlotState::DeadLetter => state.label().red().bold().to_string(),
    }
}

fn dash_if_empty(value: String) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value
    }
}
