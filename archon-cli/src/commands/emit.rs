//! `speckit-archon emit` — the workflow-facing entry point.
//!
//! Nothing here may reach stdout or stderr. Diagnostics go to
//! `<state_root>/logs/emit.log`, and only when `SPECKIT_ARCHON_LOG` is set
//! (`1` for debug, or any `RUST_LOG`-style filter).

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{Args, ValueEnum};

use archon_core::paths::emit_log_path;
use archon_core::{Concern, Settings, SyncMode};
use archon_sync::Emitter;

pub const ENV_LOG: &str = "SPECKIT_ARCHON_LOG";

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcernArg {
    /// Create or update the feature's project.
    Init,
    /// Push or pull feature documents.
    Docs,
    /// Upsert the tasks of tasks.md.
    Tasks,
    /// Pull task completion back into tasks.md.
    Status,
}

impl From<ConcernArg> for Concern {
    fn from(arg: ConcernArg) -> Self {
        match arg {
            ConcernArg::Init => Concern::Init,
            ConcernArg::Docs => Concern::DocSync,
            ConcernArg::Tasks => Concern::TaskSync,
            ConcernArg::Status => Concern::StatusPull,
        }
    }
}

#[derive(Args, Debug)]
pub struct EmitArgs {
    #[arg(value_enum)]
    pub concern: ConcernArg,

    /// Feature directory, e.g. specs/001-user-login.
    pub feature_dir: PathBuf,

    /// Direction for `docs`.
    #[arg(long, default_value_t = SyncMode::Push)]
    pub mode: SyncMode,
}

impl EmitArgs {
    pub fn run(self) {
        let Ok(settings) = Settings::resolve(&self.feature_dir) else {
            return;
        };
        init_emit_log(&settings);

        let concern: Concern = self.concern.into();
        match Emitter::new(&settings).emit(concern, &self.feature_dir, self.mode) {
            Ok(outcome) => tracing::debug!(%concern, ?outcome, "emit finished"),
            Err(err) => tracing::warn!(%concern, error = %err, "emit failed"),
        }
    }
}

fn init_emit_log(settings: &Settings) {
    let Some(filter) = std::env::var(ENV_LOG).ok().filter(|v| !v.trim().is_empty()) else {
        return;
    };
    let directive = match filter.trim() {
        "1" | "true" | "yes" => "debug".to_string(),
        other => other.to_string(),
    };

    let path = emit_log_path(&settings.state_root);
    let Some(dir) = path.parent() else {
        return;
    };
    if std::fs::create_dir_all(dir).is_err() {
        return;
    }
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(directive))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .try_init();
}
