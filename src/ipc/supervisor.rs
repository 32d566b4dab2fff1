//! Worker process lifecycle.
//!
//! `Supervisor` owns the single worker process: it spawns it, wires its
//! stdout into the framer, logs its stderr, tracks the readiness handshake,
//! and respawns it after a fixed delay when it exits on its own. Callers keep
//! a `Supervisor` (cheap to clone); the volatile `WorkerHandle` inside is
//! swapped on every respawn.
//!
//! # Lifecycle
//!
//! ```text
//!  start() ──► spawn ──► [running] ──exit──► delay ──► spawn ──► [running] ...
//!                            │                              ▲
//!                            ├── restart() ── kill ─────────┘ (no delay)
//!                            └── stop() ───── kill ──► [stopped]
//! ```
//!
//! [`Supervisor::stop`] shuts down gracefully and fails pending calls.
//! Dropping the last `Supervisor` clone without stopping aborts supervision
//! and kills the worker.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, CrashPolicy};
use crate::ipc::envelope::Inbound;
use crate::ipc::error::IpcError;
use crate::ipc::framing::LineFramer;
use crate::ipc::registry::Registry;

/// Stdout read size.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// A spawned worker instance.
///
/// Cloned out of the supervisor for each write. Once `alive` turns false it
/// never turns true again; a respawn produces a new handle.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pid: Option<u32>,
    generation: u64,
    spawned_at: DateTime<Utc>,
    stdin: mpsc::Sender<String>,
    alive: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// 1 for the first spawn, incremented on each respawn.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue one framed line for the worker's stdin.
    pub async fn write(&self, line: String) -> Result<(), IpcError> {
        if !self.is_alive() {
            return Err(IpcError::NoProcess);
        }
        self.stdin.send(line).await.map_err(|_| IpcError::NoProcess)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Point-in-time view of the supervisor, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub pid: Option<u32>,
    pub generation: u64,
    pub spawned_at: Option<DateTime<Utc>>,
    pub alive: bool,
    pub ready: bool,
    pub restarts: u32,
    pub in_flight: usize,
}

enum Control {
    Restart(oneshot::Sender<Result<(), IpcError>>),
    Stop,
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Restart(oneshot::Sender<Result<(), IpcError>>),
    Stop,
}

/// How `respawn_with_delay` ended.
enum Respawn {
    Spawned(Child),
    Stopped,
    GaveUp,
}

struct Running {
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

/// Owner-side half of the supervisor. The supervision task only holds a
/// `Weak` to it, so the last `Supervisor` drop reaches `Drop` below.
struct Lifecycle {
    running: Mutex<Option<Running>>,
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(running) = running {
            // Dropping the task drops the `Child`, which kills the worker.
            debug!("Supervisor dropped while running, aborting worker");
            running.task.abort();
        }
    }
}

struct Shared {
    config: BridgeConfig,
    registry: Registry,
    worker: RwLock<Option<WorkerHandle>>,
    ready: watch::Sender<bool>,
    generation: AtomicU64,
    restarts: AtomicU32,
}

/// Owner of the worker process.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
    lifecycle: Arc<Lifecycle>,
}

impl Supervisor {
    pub fn new(config: BridgeConfig) -> Self {
        let registry = Registry::new(config.request_timeout(), config.max_in_flight);
        let (ready, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                worker: RwLock::new(None),
                ready,
                generation: AtomicU64::new(0),
                restarts: AtomicU32::new(0),
            }),
            lifecycle: Arc::new(Lifecycle {
                running: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Registry of requests in flight to this supervisor's worker.
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Spawn the worker and begin supervising it.
    ///
    /// Fails if the first spawn fails; later respawn failures are retried
    /// in the background. A supervisor that gave up after `max_restarts`
    /// can be started again.
    pub fn start(&self) -> Result<(), IpcError> {
        let mut running = lock_running(&self.lifecycle.running);
        if running.is_some() {
            return Err(IpcError::AlreadyStarted);
        }

        let child = self.shared.spawn_worker()?;
        self.shared.restarts.store(0, Ordering::SeqCst);
        let (control, control_rx) = mpsc::channel(4);
        let task = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            Arc::downgrade(&self.lifecycle),
            child,
            control_rx,
        ));
        *running = Some(Running { control, task });
        Ok(())
    }

    /// Kill the worker and stop supervising. Pending requests fail with
    /// `IpcError::Shutdown`.
    pub async fn stop(&self) -> Result<(), IpcError> {
        let running = lock_running(&self.lifecycle.running)
            .take()
            .ok_or(IpcError::NotStarted)?;

        let _ = running.control.send(Control::Stop).await;
        if let Err(e) = running.task.await {
            warn!("Supervisor task ended abnormally: {}", e);
        }

        self.shared.clear_worker();
        self.shared.registry.fail_all(|| IpcError::Shutdown);
        info!("Worker supervisor stopped");
        Ok(())
    }

    /// Kill the current worker and respawn it immediately.
    pub async fn restart(&self) -> Result<(), IpcError> {
        let control = lock_running(&self.lifecycle.running)
            .as_ref()
            .map(|r| r.control.clone())
            .ok_or(IpcError::NotStarted)?;

        let (ack, ack_rx) = oneshot::channel();
        control
            .send(Control::Restart(ack))
            .await
            .map_err(|_| IpcError::NotStarted)?;
        ack_rx.await.map_err(|_| IpcError::NotStarted)?
    }

    /// Current worker handle, if one has been spawned.
    pub fn handle(&self) -> Option<WorkerHandle> {
        self.shared
            .worker
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// True once the current worker has sent its startup signal.
    pub fn is_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }

    /// Watch readiness transitions.
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.shared.ready.subscribe()
    }

    /// Wait until the worker reports ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), IpcError> {
        let mut ready = self.subscribe_ready();
        let wait = async { ready.wait_for(|r| *r).await.map(|_| ()) };
        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(IpcError::NotStarted),
            Err(_) => Err(IpcError::Timeout(timeout)),
        }
    }

    /// Number of respawns since `start()`.
    pub fn restart_count(&self) -> u32 {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkerStatus {
        let handle = self.handle();
        WorkerStatus {
            pid: handle.as_ref().and_then(WorkerHandle::pid),
            generation: handle.as_ref().map(WorkerHandle::generation).unwrap_or(0),
            spawned_at: handle.as_ref().map(WorkerHandle::spawned_at),
            alive: handle.as_ref().map(WorkerHandle::is_alive).unwrap_or(false),
            ready: self.is_ready(),
            restarts: self.restart_count(),
            in_flight: self.shared.registry.len(),
        }
    }
}

fn lock_running(running: &Mutex<Option<Running>>) -> std::sync::MutexGuard<'_, Option<Running>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    /// Spawn a fresh worker, install its handle, and start its I/O tasks.
    fn spawn_worker(self: &Arc<Self>) -> Result<Child, IpcError> {
        let config = &self.config;
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        info!("Spawning worker: {} {}", config.program, config.args.join(" "));
        let mut child = command.spawn().map_err(IpcError::Spawn)?;

        let stdin = child.stdin.take().ok_or(IpcError::NoProcess)?;
        let stdout = child.stdout.take().ok_or(IpcError::NoProcess)?;
        let stderr = child.stderr.take().ok_or(IpcError::NoProcess)?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let alive = Arc::new(AtomicBool::new(true));
        let (stdin_tx, stdin_rx) = mpsc::channel(config.max_in_flight.max(1));
        let pid = child.id();

        let handle = WorkerHandle {
            pid,
            generation,
            spawned_at: Utc::now(),
            stdin: stdin_tx,
            alive,
        };
        {
            // Installed before the reader starts, so its startup signal
            // always finds its own generation.
            let mut worker = self.worker.write().unwrap_or_else(|p| p.into_inner());
            *worker = Some(handle);
            self.ready.send_replace(false);
        }

        tokio::spawn(write_stdin(stdin, stdin_rx));
        tokio::spawn(read_stdout(
            Arc::clone(self),
            stdout,
            LineFramer::new(config.max_line_bytes),
            generation,
        ));
        tokio::spawn(log_stderr(stderr, generation));

        info!("Worker spawned (pid {:?}, generation {})", pid, generation);
        Ok(child)
    }

    fn mark_dead(&self) {
        let worker = self.worker.write().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = worker.as_ref() {
            handle.mark_dead();
        }
        self.ready.send_replace(false);
    }

    /// Mark the worker ready if `generation` is still the live one.
    ///
    /// Checked and published under the worker lock, which is also held
    /// while a respawn installs its handle and resets readiness.
    fn publish_ready(&self, generation: u64) -> bool {
        let worker = self.worker.read().unwrap_or_else(|p| p.into_inner());
        let current = worker
            .as_ref()
            .is_some_and(|h| h.generation == generation && h.is_alive());
        if current {
            self.ready.send_replace(true);
        }
        current
    }

    fn clear_worker(&self) {
        self.mark_dead();
        *self.worker.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Respawn after the configured delay.
    async fn respawn_with_delay(
        self: &Arc<Self>,
        control: &mut mpsc::Receiver<Control>,
        consecutive: &mut u32,
    ) -> Respawn {
        loop {
            *consecutive += 1;
            if let Some(max) = self.config.max_restarts {
                if *consecutive > max {
                    error!("Worker restarted {} times without becoming ready, giving up", max);
                    return Respawn::GaveUp;
                }
            }

            let delay = self.config.restart_delay();
            info!("Restarting worker in {:?}", delay);
            let mut ack = None;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cmd = control.recv() => match cmd {
                    Some(Control::Restart(tx)) => ack = Some(tx),
                    Some(Control::Stop) | None => return Respawn::Stopped,
                },
            }

            match self.spawn_worker() {
                Ok(child) => {
                    self.restarts.fetch_add(1, Ordering::SeqCst);
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                    return Respawn::Spawned(child);
                }
                Err(e) => {
                    error!("Failed to respawn worker: {}", e);
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(e));
                    }
                }
            }
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    lifecycle: Weak<Lifecycle>,
    mut child: Child,
    mut control: mpsc::Receiver<Control>,
) {
    let mut consecutive = 0u32;

    loop {
        let exit = tokio::select! {
            status = child.wait() => Exit::Exited(status),
            cmd = control.recv() => match cmd {
                Some(Control::Restart(ack)) => Exit::Restart(ack),
                Some(Control::Stop) | None => Exit::Stop,
            },
        };

        if !matches!(exit, Exit::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill worker: {}", e);
            }
        }
        let was_ready = *shared.ready.borrow();
        shared.mark_dead();

        match exit {
            Exit::Stop => {
                debug!("Supervisor received stop");
                return;
            }
            Exit::Restart(ack) => {
                info!("Restarting worker on request");
                consecutive = 0;
                match shared.spawn_worker() {
                    Ok(next) => {
                        shared.restarts.fetch_add(1, Ordering::SeqCst);
                        let _ = ack.send(Ok(()));
                        child = next;
                        continue;
                    }
                    Err(e) => {
                        error!("Failed to respawn worker: {}", e);
                        let _ = ack.send(Err(e));
                    }
                }
            }
            Exit::Exited(status) => {
                match status {
                    Ok(status) => warn!("Worker exited unexpectedly: {}", status),
                    Err(e) => warn!("Failed to wait on worker: {}", e),
                }
                if was_ready {
                    consecutive = 0;
                }
                if shared.config.crash_policy == CrashPolicy::FailFast {
                    let failed = shared.registry.fail_all(|| IpcError::WorkerCrashed);
                    if failed > 0 {
                        warn!("Failed {} in-flight requests after worker exit", failed);
                    }
                }
            }
        }

        match shared.respawn_with_delay(&mut control, &mut consecutive).await {
            Respawn::Spawned(next) => child = next,
            Respawn::Stopped => return,
            Respawn::GaveUp => {
                // Release the running slot so the owner can start() again.
                if let Some(lifecycle) = lifecycle.upgrade() {
                    lock_running(&lifecycle.running).take();
                }
                shared.clear_worker();
                return;
            }
        }
    }
}

/// Forward queued lines to the worker's stdin.
async fn write_stdin(mut stdin: ChildStdin, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!("Failed to write to worker stdin: {}", e);
            return;
        }
        if let Err(e) = stdin.flush().await {
            warn!("Failed to flush worker stdin: {}", e);
            return;
        }
    }
}

/// Frame stdout and dispatch each record.
async fn read_stdout(
    shared: Arc<Shared>,
    mut stdout: ChildStdout,
    mut framer: LineFramer,
    generation: u64,
) {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => {
                debug!("Worker stdout closed");
                framer.finish();
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to read worker stdout: {}", e);
                return;
            }
        };

        for record in framer.push(&chunk[..n]) {
            match record {
                Inbound::Startup => {
                    if shared.publish_ready(generation) {
                        info!("Worker generation {} reported ready", generation);
                    } else {
                        debug!("Ignoring startup signal from stale generation {}", generation);
                    }
                }
                Inbound::Response {
                    correlation_id,
                    outcome,
                } => {
                    shared.registry.resolve(&correlation_id, outcome);
                }
                Inbound::Unaddressed(value) => {
                    debug!("Ignoring unaddressed worker record: {}", value);
                }
            }
        }
    }
}

/// Stderr is diagnostics only.
async fn log_stderr(stderr: ChildStderr, generation: u64) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                info!("[worker {}] {}", generation, line.trim_end())
            }
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                debug!("Worker stderr read failed: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_before_start() {
        let supervisor = Supervisor::new(BridgeConfig::default());
        let status = supervisor.status();
        assert!(status.pid.is_none());
        assert_eq!(status.generation, 0);
        assert!(!status.alive);
        assert!(!status.ready);
        assert_eq!(status.restarts, 0);
        assert!(supervisor.handle().is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_calls_before_start() {
        let supervisor = Supervisor::new(BridgeConfig::default());
        assert!(matches!(supervisor.stop().await, Err(IpcError::NotStarted)));
        assert!(matches!(supervisor.restart().await, Err(IpcError::NotStarted)));

        let err = supervisor
            .wait_ready(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    fn live_handle(generation: u64, stdin: mpsc::Sender<String>) -> WorkerHandle {
        WorkerHandle {
            pid: Some(1),
            generation,
            spawned_at: Utc::now(),
            stdin,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    #[tokio::test]
    async fn test_dead_handle_rejects_writes() {
        let (stdin, mut rx) = mpsc::channel(1);
        let handle = live_handle(1, stdin);

        handle.write("a\n".to_string()).await.expect("live write");
        assert_eq!(rx.recv().await.as_deref(), Some("a\n"));

        handle.mark_dead();
        assert!(!handle.is_alive());
        assert!(matches!(
            handle.write("b\n".to_string()).await,
            Err(IpcError::NoProcess)
        ));
    }

    #[test]
    fn test_stale_generation_cannot_publish_ready() {
        let supervisor = Supervisor::new(BridgeConfig::default());
        let shared = &supervisor.shared;
        let (stdin, _rx) = mpsc::channel(1);
        *shared.worker.write().unwrap() = Some(live_handle(2, stdin));

        // A reader left over from generation 1 sees its startup line late.
        assert!(!shared.publish_ready(1));
        assert!(!supervisor.is_ready());

        assert!(shared.publish_ready(2));
        assert!(supervisor.is_ready());

        shared.mark_dead();
        assert!(!supervisor.is_ready());
        assert!(!shared.publish_ready(2));
        assert!(!supervisor.is_ready());
    }
}
