//! `speckit-archon probe` — availability check.

use std::path::{Path, PathBuf};

use clap::Args;
use colored::Colorize;

use archon_probe::{probe_at, Availability};

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Directory to probe from (defaults to --workspace or the current directory).
    pub dir: Option<PathBuf>,

    /// Print why the integration is or is not available.
    #[arg(long)]
    pub explain: bool,
}

impl ProbeArgs {
    pub fn run(self, workspace: Option<&Path>) {
        let start = self
            .dir
            .or_else(|| workspace.map(Path::to_path_buf))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let availability = probe_at(&start);
        if !self.explain {
            return;
        }
        match availability {
            Availability::Available { api_url } => {
                println!("{} Archon integration available ({api_url})", "✓".green().bold());
            }
            Availability::Unavailable(reason) => {
                println!("{} Archon integration unavailable: {reason}", "✗".yellow().bold());
            }
        }
    }
}
