//! `speckit-archon store` — local id mapping store.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use archon_core::{timestamp_now, EntityKind, FeatureId, Settings, StateStore};

use crate::parse_feature;

#[derive(Subcommand, Debug)]
pub enum StoreCommand {
    /// Print the remote id for a local entity (empty line when unmapped).
    Get {
        #[arg(value_parser = parse_feature)]
        feature: FeatureId,
        /// project, document, task or sync-meta.
        kind: EntityKind,
        /// Document filename or task id; empty for the project.
        #[arg(long, default_value = "")]
        key: String,
    },
    /// Record the remote id for a local entity.
    Set {
        #[arg(value_parser = parse_feature)]
        feature: FeatureId,
        kind: EntityKind,
        remote_id: String,
        #[arg(long, default_value = "")]
        key: String,
    },
    /// Print the last sync time of a document.
    MetaGet {
        #[arg(value_parser = parse_feature)]
        feature: FeatureId,
        filename: String,
    },
    /// Record the last sync time of a document (defaults to now).
    MetaSet {
        #[arg(value_parser = parse_feature)]
        feature: FeatureId,
        filename: String,
        timestamp: Option<String>,
    },
    /// List mappings, optionally for one feature.
    List {
        #[arg(value_parser = parse_feature)]
        feature: Option<FeatureId>,
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct MappingRow {
    #[tabled(rename = "Feature")]
    feature: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Local key")]
    local_key: String,
    #[tabled(rename = "Remote id")]
    remote_id: String,
    #[tabled(rename = "Updated")]
    updated_at: String,
}

pub fn run(command: StoreCommand, settings: &Settings) -> Result<()> {
    let store = StateStore::new(&settings.state_root);

    match command {
        StoreCommand::Get { feature, kind, key } => {
            let remote_id = store
                .load_mapping(&feature, kind, &key)
                .with_context(|| format!("failed to read {kind} mapping for {feature}"))?;
            println!("{remote_id}");
        }
        StoreCommand::Set {
            feature,
            kind,
            remote_id,
            key,
        } => {
            store
                .save_mapping(&feature, kind, &key, &remote_id)
                .with_context(|| format!("failed to save {kind} mapping for {feature}"))?;
        }
        StoreCommand::MetaGet { feature, filename } => {
            let at = store
                .load_sync_meta(&feature, &filename)
                .with_context(|| format!("failed to read sync metadata for {filename}"))?;
            println!("{at}");
        }
        StoreCommand::MetaSet {
            feature,
            filename,
            timestamp,
        } => {
            let at = timestamp.unwrap_or_else(timestamp_now);
            store
                .save_sync_meta(&feature, &filename, &at)
                .with_context(|| format!("failed to save sync metadata for {filename}"))?;
        }
        StoreCommand::List { feature, json } => {
            let features = match feature {
                Some(feature) => vec![feature],
                None => store.list_features().context("failed to list features")?,
            };
            let rows = collect_rows(&store, &features)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows).context("failed to render mappings JSON")?
                );
            } else if rows.is_empty() {
                println!("no mappings under {}", settings.state_root.display());
            } else {
                let mut table = Table::new(rows);
                table.with(Style::rounded());
                println!("{table}");
            }
        }
    }

    Ok(())
}

fn collect_rows(store: &StateStore, features: &[FeatureId]) -> Result<Vec<MappingRow>> {
    let mut rows = Vec::new();
    for feature in features {
        for kind in EntityKind::ALL {
            let records = store
                .list_mappings(feature, kind)
                .with_context(|| format!("failed to list {kind} mappings for {feature}"))?;
            rows.extend(records.into_iter().map(|record| MappingRow {
                feature: record.feature.to_string(),
                kind: record.kind.to_string(),
                local_key: record.local_key,
                remote_id: record.remote_id,
                updated_at: record.updated_at,
            }));
        }
    }
    Ok(rows)
}
