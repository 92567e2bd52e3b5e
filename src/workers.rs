use crate::config::FastCgiConfig;
use parking_lot::Mutex;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time a worker gets to exit after SIGTERM before it is killed
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Upper bound for waiting on supervisors during stop
const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State of one worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not started, or supervisor has exited
    Stopped,
    /// Process is being spawned
    Starting,
    /// Process is alive
    Running,
    /// Process exited unexpectedly, waiting out the restart delay
    Restarting,
    /// Pool is shutting down
    Stopping,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub index: usize,
    pub port: u16,
    pub state: WorkerState,
    pub pid: Option<u32>,
    /// Respawns after unexpected exits
    pub restarts: u32,
}

/// Fixed-size pool of FastCGI worker processes on sequential ports.
///
/// Each worker has its own supervisor task cycling through
/// Starting -> Running -> Restarting -> Starting until the pool stops. The
/// stopping flag is raised before any process is signalled so exits caused by
/// [`stop`](WorkerPool::stop) are never mistaken for crashes.
pub struct WorkerPool {
    config: FastCgiConfig,
    ports: Vec<u16>,
    /// Round-robin position into `ports`
    cursor: Mutex<usize>,
    stopping: AtomicBool,
    status: Mutex<Vec<WorkerStatus>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl WorkerPool {
    pub fn new(config: FastCgiConfig) -> Arc<Self> {
        let ports = config.ports();
        let status = ports
            .iter()
            .enumerate()
            .map(|(index, &port)| WorkerStatus {
                index,
                port,
                state: WorkerState::Stopped,
                pid: None,
                restarts: 0,
            })
            .collect();

        Arc::new(Self {
            config,
            ports,
            cursor: Mutex::new(0),
            stopping: AtomicBool::new(false),
            status: Mutex::new(status),
            supervisors: Mutex::new(Vec::new()),
            shutdown_tx: Mutex::new(None),
        })
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Next worker port in rotation; no health or load awareness
    pub fn next_port(&self) -> Option<u16> {
        if self.ports.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let port = self.ports[*cursor % self.ports.len()];
        *cursor = (*cursor + 1) % self.ports.len();
        Some(port)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// True while some worker is alive or being respawned and no stop is in progress
    pub fn is_running(&self) -> bool {
        !self.is_stopping()
            && self
                .status
                .lock()
                .iter()
                .any(|w| w.state != WorkerState::Stopped)
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.status.lock().clone()
    }

    fn set_state(&self, index: usize, state: WorkerState, pid: Option<u32>) {
        if let Some(slot) = self.status.lock().get_mut(index) {
            slot.state = state;
            slot.pid = pid;
        }
    }

    fn record_restart(&self, index: usize) {
        if let Some(slot) = self.status.lock().get_mut(index) {
            slot.restarts += 1;
        }
    }

    /// Launch one supervisor per port, staggered so workers don't race for ports
    pub async fn start(self: &Arc<Self>) {
        if !self.supervisors.lock().is_empty() {
            warn!("FastCGI pool already started");
            return;
        }

        self.stopping.store(false, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        info!(
            command = %self.config.command,
            workers = self.ports.len(),
            base_port = self.config.base_port,
            "Starting FastCGI workers"
        );

        for (index, &port) in self.ports.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.start_stagger()).await;
            }
            if self.is_stopping() {
                break;
            }
            let pool = Arc::clone(self);
            let shutdown_rx = shutdown_rx.clone();
            let handle = tokio::spawn(async move { pool.supervise(index, port, shutdown_rx).await });
            self.supervisors.lock().push(handle);
        }
    }

    async fn supervise(self: Arc<Self>, index: usize, port: u16, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if self.is_stopping() {
                break;
            }
            self.set_state(index, WorkerState::Starting, None);

            let mut child = match self.spawn_worker(port) {
                Ok(child) => child,
                Err(e) => {
                    // The rest of the pool keeps serving
                    error!(worker = index, port, error = %e, "Failed to start FastCGI worker");
                    break;
                }
            };
            let pid = child.id();
            self.set_state(index, WorkerState::Running, pid);
            info!(worker = index, port, pid, "FastCGI worker started");

            tokio::select! {
                status = child.wait() => {
                    if self.is_stopping() {
                        debug!(worker = index, port, "FastCGI worker exited during shutdown");
                        break;
                    }
                    match status {
                        Ok(status) => warn!(worker = index, port, %status, "FastCGI worker exited unexpectedly"),
                        Err(e) => warn!(worker = index, port, error = %e, "Lost track of FastCGI worker"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    self.set_state(index, WorkerState::Stopping, pid);
                    stop_child(index, &mut child).await;
                    break;
                }
            }

            self.set_state(index, WorkerState::Restarting, None);
            self.record_restart(index);
            tokio::select! {
                _ = tokio::time::sleep(self.config.restart_delay()) => {}
                _ = shutdown_rx.changed() => break,
            }
            info!(worker = index, port, "Restarting FastCGI worker");
        }

        self.set_state(index, WorkerState::Stopped, None);
    }

    fn spawn_worker(&self, port: u16) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.config.command);
        cmd.arg("-b")
            .arg(format!("{}:{}", self.config.host, port))
            .env("PHP_FCGI_CHILDREN", "0")
            .env("PHP_FCGI_MAX_REQUESTS", self.config.max_requests.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd.spawn()
    }

    /// Stop every worker, then sweep leftover processes with the same name
    pub async fn stop(&self) {
        // Must be visible before any worker is signalled
        self.stopping.store(true, Ordering::SeqCst);

        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(true);
        }

        let handles: Vec<JoinHandle<()>> = self.supervisors.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(SUPERVISOR_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("FastCGI supervisor did not finish in time");
            }
        }

        sweep_orphans(&self.config.command).await;
        info!("FastCGI workers stopped");
    }
}

async fn stop_child(index: usize, child: &mut Child) {
    if let Some(pid) = child.id() {
        debug!(worker = index, pid, "Sending SIGTERM to FastCGI worker");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
        Ok(Ok(status)) => debug!(worker = index, %status, "FastCGI worker exited"),
        Ok(Err(e)) => warn!(worker = index, error = %e, "Error waiting for FastCGI worker to exit"),
        Err(_) => {
            warn!(worker = index, "FastCGI worker ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

/// Kill processes left behind under the worker's image name
async fn sweep_orphans(command: &str) {
    let Some(name) = Path::new(command).file_name().and_then(|n| n.to_str()) else {
        return;
    };

    #[cfg(windows)]
    let result = Command::new("taskkill")
        .args(["/F", "/IM", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    #[cfg(not(windows))]
    let result = Command::new("pkill")
        .args(["-x", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match result {
        Ok(status) => debug!(name, %status, "Orphan sweep finished"),
        Err(e) => debug!(name, error = %e, "Orphan sweep unavailable"),
    }
}
