//! `speckit-archon daemon` — consumer lifecycle and logs.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use archon_core::paths::{emit_log_path, logs_dir, socket_path, stderr_log_path, stdout_log_path};
use archon_core::Settings;
use archon_daemon::{request_status, request_stop, run_once, start_blocking, DaemonError};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon (timer + watcher + socket server).
    Start(DaemonStartArgs),
    /// Process the queue once against the service and print the report.
    RunOnce,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
    /// Print recent daemon log lines.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonStartArgs {
    /// Spawn the daemon in the background and return immediately.
    #[arg(long)]
    pub detach: bool,
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show only the stderr log file.
    #[arg(long)]
    pub stderr_only: bool,

    /// Also show the emitter diagnostics log.
    #[arg(long)]
    pub emit: bool,
}

pub fn run(command: DaemonCommand, settings: Settings) -> Result<()> {
    let state_root = settings.state_root.clone();

    match command {
        DaemonCommand::Start(args) if args.detach => {
            let pid = spawn_detached(&settings)?;
            println!("daemon started in background (pid {pid})");
        }
        DaemonCommand::Start(_) => {
            start_blocking(settings).context("daemon exited with error")?;
        }
        DaemonCommand::RunOnce => {
            let report = run_once(&settings).context("queue processing failed")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render report JSON")?
            );
        }
        DaemonCommand::Stop => match request_stop(&state_root) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => {
            let status = match request_status(&state_root) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&state_root).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render daemon status JSON")?
            );
        }
        DaemonCommand::Logs(args) => {
            if !args.stderr_only {
                print_tail(&stdout_log_path(&state_root), args.lines)
                    .context("failed to read daemon stdout log")?;
            }
            print_tail(&stderr_log_path(&state_root), args.lines)
                .context("failed to read daemon stderr log")?;
            if args.emit {
                print_tail(&emit_log_path(&state_root), args.lines)
                    .context("failed to read emit log")?;
            }
        }
    }

    Ok(())
}

/// Re-exec this binary as `daemon start` with output appended to the state
/// root's log files.
fn spawn_detached(settings: &Settings) -> Result<u32> {
    let state_root = &settings.state_root;
    let dir = logs_dir(state_root);
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

    let stdout = append(&stdout_log_path(state_root))?;
    let stderr = append(&stderr_log_path(state_root))?;
    let exe = std::env::current_exe().context("could not locate the current executable")?;

    let child = Command::new(exe)
        .arg("--workspace")
        .arg(&settings.workspace_root)
        .args(["daemon", "start"])
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .context("failed to spawn background daemon")?;
    Ok(child.id())
}

fn append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut tail = VecDeque::<String>::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if lines == 0 {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
