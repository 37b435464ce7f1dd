use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;

use archon_core::paths::{logs_dir, requests_root, run_dir, socket_path, PENDING_EXT};
use archon_core::{format_timestamp, Concern, FeatureId, Settings};

use crate::cycle::{CycleReport, Processor};
use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::service::{ArchonService, HttpService};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Pending slots and the fingerprint of their bytes.
type Snapshot = BTreeSet<(FeatureId, Concern, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Watcher,
    Socket,
}

impl Trigger {
    fn label(self) -> &'static str {
        match self {
            Trigger::Timer => "timer",
            Trigger::Watcher => "watcher",
            Trigger::Socket => "socket",
        }
    }
}

struct CycleJob {
    trigger: Trigger,
    respond_to: Option<oneshot::Sender<Result<CycleReport, String>>>,
}

/// Runtime facts reported by `status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DaemonStats {
    pub started_at: String,
    pub cycles: u64,
    pub last_cycle_at: Option<String>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

type SharedStats = Arc<RwLock<DaemonStats>>;

/// Start the daemon against the configured HTTP service and block the
/// current thread until it exits.
pub fn start_blocking(settings: Settings) -> Result<(), DaemonError> {
    init_tracing();
    let service: Arc<dyn ArchonService> = Arc::new(HttpService::from_settings(&settings)?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(settings, service))
}

/// Run a single cycle against the configured HTTP service, without the
/// socket or watcher.
pub fn run_once(settings: &Settings) -> Result<CycleReport, DaemonError> {
    let service = HttpService::from_settings(settings)?;
    Processor::from_settings(settings).run_cycle(&service, Utc::now())
}

/// Run the daemon until `stop`, ctrl-c, or a task failure.
pub async fn run(settings: Settings, service: Arc<dyn ArchonService>) -> Result<(), DaemonError> {
    let state_root = settings.state_root.clone();
    ensure_runtime_dirs(&state_root)?;
    tracing::info!(
        state_root = %state_root.display(),
        poll_interval_secs = settings.poll_interval().as_secs(),
        "archon daemon starting",
    );

    let stats: SharedStats = Arc::new(RwLock::new(DaemonStats {
        started_at: format_timestamp(Utc::now()),
        ..DaemonStats::default()
    }));
    let processor = Processor::from_settings(&settings);

    let (cycle_tx, cycle_rx) = mpsc::channel::<CycleJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let timer_handle = {
        let shutdown = shutdown_tx.clone();
        let cycle_tx = cycle_tx.clone();
        let interval = settings.poll_interval();
        tokio::spawn(async move {
            let result = timer_task(interval, cycle_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let state_root = state_root.clone();
        let cycle_tx = cycle_tx.clone();
        tokio::spawn(async move {
            let result = watcher_task(state_root, cycle_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let result =
                processor_task(processor, service, stats, cycle_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state_root = state_root.clone();
        let stats = stats.clone();
        let cycle_tx = cycle_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                state_root,
                stats,
                cycle_tx,
                shutdown.clone(),
                shutdown.subscribe(),
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let state_root = state_root.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(state_root, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!(
                            "ctrl-c handler failed: {err}"
                        ))),
                    }
                }
            }
        })
    };
    drop(cycle_tx);

    let (timer, watcher, processor, socket, rotation, signal) = tokio::join!(
        timer_handle,
        watcher_handle,
        processor_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    handle_join("timer", timer)?;
    handle_join("watcher", watcher)?;
    handle_join("processor", processor)?;
    handle_join("socket_server", socket)?;
    handle_join("log_rotation", rotation)?;
    handle_join("signal_handler", signal)?;
    tracing::info!("archon daemon stopped");
    Ok(())
}

async fn timer_task(
    interval: Duration,
    cycle_tx: mpsc::Sender<CycleJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => nudge(&cycle_tx, Trigger::Timer),
        }
    }
    Ok(())
}

async fn watcher_task(
    state_root: PathBuf,
    cycle_tx: mpsc::Sender<CycleJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let requests = requests_root(&state_root);
    fs::create_dir_all(&requests).map_err(|e| io_err(&requests, e))?;
    // Event paths arrive canonicalized on some platforms (/private/var on macOS).
    let requests = fs::canonicalize(&requests).unwrap_or(requests);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&requests, RecursiveMode::Recursive)?;
    tracing::debug!(path = %requests.display(), "watching request directory");

    let mut debounce = HashMap::<PathBuf, Instant>::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                let now = Instant::now();
                let wake = event
                    .paths
                    .iter()
                    .filter(|path| is_pending_request(path, &requests))
                    .fold(false, |wake, path| {
                        should_process_event(&mut debounce, path, now) || wake
                    });
                if wake {
                    nudge(&cycle_tx, Trigger::Watcher);
                }
            }
        }
    }
    Ok(())
}

async fn processor_task(
    processor: Processor,
    service: Arc<dyn ArchonService>,
    stats: SharedStats,
    mut cycle_rx: mpsc::Receiver<CycleJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut last_snapshot: Option<Snapshot> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            job = cycle_rx.recv() => {
                let Some(job) = job else { break };
                let started = Instant::now();

                // Our own restores and releases also fire the watcher; only
                // wake for it when the pending set actually changed.
                let skip_if = (job.trigger == Trigger::Watcher)
                    .then(|| last_snapshot.clone())
                    .flatten();
                let processor = processor.clone();
                let service = service.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    cycle_blocking(&processor, service.as_ref(), skip_if)
                })
                .await
                .map_err(|err| DaemonError::Protocol(format!("cycle task join error: {err}")))?;

                let response = match outcome {
                    Ok(None) => Ok(CycleReport::default()),
                    Ok(Some((report, snap))) => {
                        last_snapshot = Some(snap);
                        if !report.is_idle() {
                            tracing::info!(
                                trigger = job.trigger.label(),
                                applied = report.applied,
                                retried = report.retried,
                                deferred = report.deferred,
                                dead_lettered = report.dead_lettered,
                                waiting = report.waiting,
                                duration_ms = started.elapsed().as_millis() as u64,
                                "cycle completed",
                            );
                        }
                        let mut stats = stats.write().await;
                        stats.cycles += 1;
                        stats.last_cycle_at = Some(format_timestamp(Utc::now()));
                        stats.last_report = Some(report.clone());
                        stats.last_error = None;
                        Ok(report)
                    }
                    Err(err) => {
                        tracing::error!(
                            trigger = job.trigger.label(),
                            error = %err,
                            "cycle failed",
                        );
                        stats.write().await.last_error = Some(err.to_string());
                        Err(err.to_string())
                    }
                };

                if let Some(respond_to) = job.respond_to {
                    let _ = respond_to.send(response);
                }
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    state_root: PathBuf,
    stats: SharedStats,
    cycle_tx: mpsc::Sender<CycleJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let run = run_dir(&state_root);
    fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;

    let socket = socket_path(&state_root);
    prepare_socket_for_bind(&socket)?;
    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state_root = state_root.clone();
                let stats = stats.clone();
                let cycle_tx = cycle_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_socket_client(stream, state_root, stats, cycle_tx, shutdown_tx).await
                    {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    let _ = fs::remove_file(&socket);
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state_root: PathBuf,
    stats: SharedStats,
    cycle_tx: mpsc::Sender<CycleJob>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(build_status_payload(&state_root, &stats).await),
            "poll" => match run_cycle_now(&cycle_tx).await {
                Ok(report) => DaemonResponse::ok(json!(report)),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }
    Ok(())
}

async fn build_status_payload(state_root: &Path, stats: &SharedStats) -> Value {
    let stats = stats.read().await.clone();
    let queue = archon_sync::RequestQueue::new(state_root);
    let pending = queue.list_pending().map(|p| p.len()).unwrap_or(0);
    let dead_letters = queue.list_dead_letters().map(|d| d.len()).unwrap_or(0);

    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": stats.started_at,
        "cycles": stats.cycles,
        "last_cycle_at": stats.last_cycle_at,
        "last_report": stats.last_report,
        "last_error": stats.last_error,
        "pending": pending,
        "dead_letters": dead_letters,
        "socket": socket_path(state_root).display().to_string(),
        "state_root": state_root.display().to_string(),
    })
}

/// Queue a cycle without waiting. A full channel already holds a cycle that
/// will see the same requests.
fn nudge(cycle_tx: &mpsc::Sender<CycleJob>, trigger: Trigger) {
    let _ = cycle_tx.try_send(CycleJob {
        trigger,
        respond_to: None,
    });
}

async fn run_cycle_now(cycle_tx: &mpsc::Sender<CycleJob>) -> Result<CycleReport, DaemonError> {
    let (tx, rx) = oneshot::channel();
    cycle_tx
        .send(CycleJob {
            trigger: Trigger::Socket,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("cycle queue"))?;
    rx.await
        .map_err(|_| DaemonError::ChannelClosed("cycle response"))?
        .map_err(DaemonError::Protocol)
}

async fn log_rotation_task(
    state_root: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let state_root = state_root.clone();
                // Errors are logged inside rotate_logs.
                let _ = tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&state_root);
                })
                .await;
            }
        }
    }
    Ok(())
}

fn cycle_blocking(
    processor: &Processor,
    service: &dyn ArchonService,
    skip_if: Option<Snapshot>,
) -> Result<Option<(CycleReport, Snapshot)>, DaemonError> {
    if let Some(previous) = skip_if {
        if snapshot(processor)? == previous {
            return Ok(None);
        }
    }
    let report = processor.run_cycle(service, Utc::now())?;
    Ok(Some((report, snapshot(processor)?)))
}

fn snapshot(processor: &Processor) -> Result<Snapshot, DaemonError> {
    let queue = processor.queue();
    let mut snap = Snapshot::new();
    for (feature, concern) in queue.list_pending()? {
        if let Some(fingerprint) = queue.pending_fingerprint(&feature, concern)? {
            snap.insert((feature, concern, fingerprint));
        }
    }
    Ok(snap)
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn is_pending_request(path: &Path, requests: &Path) -> bool {
    path.starts_with(requests) && path.extension().and_then(|e| e.to_str()) == Some(PENDING_EXT)
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }
    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::Protocol(format!(
            "daemon socket already in use: {}",
            socket.display()
        )));
    }
    tracing::warn!(socket = %socket.display(), "removing stale daemon socket before bind");
    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(state_root: &Path) -> Result<(), DaemonError> {
    for dir in [requests_root(state_root), run_dir(state_root), logs_dir(state_root)] {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!("{task} task join failure: {err}"))),
    }
}

/// Install the daemon's stdout subscriber. `RUST_LOG` overrides the `info`
/// default.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn debounce_coalesces_rapid_events() {
        let threshold = Duration::from_millis(100);
        let mut debounce = HashMap::<PathBuf, Instant>::new();
        let path = PathBuf::from("/state/requests/001-x/task-sync.json");
        let mut wakes = 0usize;

        for _ in 0..5 {
            let now = Instant::now();
            if should_process_event_with_threshold(&mut debounce, &path, now, threshold) {
                wakes += 1;
            }
            advance(Duration::from_millis(10)).await;
        }
        assert_eq!(wakes, 1, "rapid emits should collapse to one wake-up");

        advance(Duration::from_millis(150)).await;
        assert!(should_process_event_with_threshold(
            &mut debounce,
            &path,
            Instant::now(),
            threshold
        ));
    }

    #[test]
    fn only_pending_records_wake_the_loop() {
        let requests = Path::new("/state/requests");
        assert!(is_pending_request(Path::new("/state/requests/001-x/init.json"), requests));
        assert!(!is_pending_request(Path::new("/state/requests/001-x/init.inflight"), requests));
        assert!(!is_pending_request(Path::new("/state/requests/001-x/init.retry"), requests));
        assert!(!is_pending_request(Path::new("/state/mappings/001-x/project/_.json"), requests));
    }
}
