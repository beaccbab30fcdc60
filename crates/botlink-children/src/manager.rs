//! Child process manager.
//!
//! Discovers declarations, launches compatible children behind their own
//! [`ForwardingProxy`], watches them, and restarts them when they die.
//!
//! Lifecycle operations (`launch`, `stop`, `reload`, restarts) are
//! serialized by one async lock so a name never has two live processes.
//! Watchers never call back into the manager directly; they post an exit
//! notice to a restart worker that runs the stop/launch pair.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use botlink_core::version::check_compatible;
use botlink_settings::{BotSettings, ChildrenSettings, ProxySettings, secs};

use crate::errors::{ChildError, Result};
use crate::ports::PortAllocator;
use crate::process::{self, ExitNotice, ProcessHandle, TERMINATE_GRACE};
use crate::proxy::{ChildFrameHandler, ForwardingProxy};
use crate::spec::{ChildSpec, discover_specs, load_spec};
use crate::token::generate_token;

/// Version reported to compatibility checks when none is configured.
pub const MANAGER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result of a launch request that did not fail outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The child is running behind a proxy on `port`.
    Launched {
        /// Proxy port handed to the child.
        port: u16,
    },
    /// The manager version does not satisfy the child's ranges.
    Incompatible,
}

/// Whether a child currently has a live process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    /// A process is live.
    Running,
    /// No process.
    Stopped,
}

/// Serializable view of one discovered child.
#[derive(Clone, Debug, Serialize)]
pub struct ChildProcessInfo {
    /// Child name.
    pub name: String,
    /// Declared version.
    pub version: String,
    /// Declared description.
    pub description: String,
    /// Running or stopped.
    pub status: ChildStatus,
    /// Proxy port while running.
    pub port: Option<u16>,
    /// OS process id while running.
    pub pid: Option<u32>,
    /// When the current process was started.
    pub started_at: Option<DateTime<Utc>>,
    /// Automatic restarts since the last manual launch.
    pub restarts: u32,
}

/// A live child.
struct ChildProcess {
    launch_id: Uuid,
    spec: ChildSpec,
    port: u16,
    pid: Option<u32>,
    process: ProcessHandle,
    proxy: Arc<ForwardingProxy>,
    started_at: DateTime<Utc>,
    restarts: u32,
    watch_cancel: CancellationToken,
}

/// Options for [`ChildProcessManager`].
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Directory scanned for child declarations.
    pub children_dir: PathBuf,
    /// Children tuning.
    pub children: ChildrenSettings,
    /// Proxy tuning.
    pub proxy: ProxySettings,
}

impl ManagerOptions {
    /// Derive options from loaded settings.
    pub fn from_settings(settings: &BotSettings) -> Self {
        Self {
            children_dir: PathBuf::from(&settings.children.dir),
            children: settings.children.clone(),
            proxy: settings.proxy.clone(),
        }
    }
}

struct Inner {
    options: ManagerOptions,
    manager_version: String,
    ports: Arc<PortAllocator>,
    specs: RwLock<BTreeMap<String, ChildSpec>>,
    running: Mutex<HashMap<String, ChildProcess>>,
    lifecycle: tokio::sync::Mutex<()>,
    handler: RwLock<Option<Arc<dyn ChildFrameHandler>>>,
    exits_tx: mpsc::UnboundedSender<ExitNotice>,
    exits_rx: Mutex<Option<mpsc::UnboundedReceiver<ExitNotice>>>,
    cancel: CancellationToken,
    booted: AtomicBool,
}

/// Supervises child processes.
#[derive(Clone)]
pub struct ChildProcessManager {
    inner: Arc<Inner>,
}

impl ChildProcessManager {
    /// Create a manager sharing `ports` with any other users.
    pub fn new(options: ManagerOptions, ports: Arc<PortAllocator>) -> Self {
        let manager_version = options
            .children
            .manager_version
            .clone()
            .unwrap_or_else(|| MANAGER_VERSION.to_string());
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                options,
                manager_version,
                ports,
                specs: RwLock::new(BTreeMap::new()),
                running: Mutex::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                handler: RwLock::new(None),
                exits_tx,
                exits_rx: Mutex::new(Some(exits_rx)),
                cancel: CancellationToken::new(),
                booted: AtomicBool::new(false),
            }),
        }
    }

    /// Version compared against each child's compatible ranges.
    pub fn manager_version(&self) -> &str {
        &self.inner.manager_version
    }

    /// Directory scanned by [`discover`](Self::discover).
    pub fn children_dir(&self) -> &Path {
        &self.inner.options.children_dir
    }

    /// Install the handler for frames from every child, current and future.
    pub fn set_message_handler(&self, handler: Arc<dyn ChildFrameHandler>) {
        *self.inner.handler.write() = Some(Arc::clone(&handler));
        for child in self.inner.running.lock().values() {
            child.proxy.set_message_handler(Arc::clone(&handler));
        }
    }

    /// Scan the children directory and replace the known declarations.
    pub fn discover(&self) -> Vec<ChildSpec> {
        let found = discover_specs(self.children_dir());
        let mut specs = self.inner.specs.write();
        specs.clear();
        for spec in &found {
            let _ = specs.insert(spec.name.clone(), spec.clone());
        }
        info!(count = found.len(), dir = %self.children_dir().display(), "children discovered");
        found
    }

    /// Declaration for `name`, if discovered.
    pub fn metadata(&self, name: &str) -> Option<ChildSpec> {
        self.inner.specs.read().get(name).cloned()
    }

    /// Every discovered child with its run state, sorted by name.
    pub fn list(&self) -> Vec<ChildProcessInfo> {
        let specs = self.inner.specs.read();
        let running = self.inner.running.lock();
        specs
            .values()
            .map(|spec| match running.get(&spec.name) {
                Some(child) => ChildProcessInfo {
                    name: spec.name.clone(),
                    version: spec.version.clone(),
                    description: spec.description.clone(),
                    status: ChildStatus::Running,
                    port: Some(child.port),
                    pid: child.pid,
                    started_at: Some(child.started_at),
                    restarts: child.restarts,
                },
                None => ChildProcessInfo {
                    name: spec.name.clone(),
                    version: spec.version.clone(),
                    description: spec.description.clone(),
                    status: ChildStatus::Stopped,
                    port: None,
                    pid: None,
                    started_at: None,
                    restarts: 0,
                },
            })
            .collect()
    }

    /// Whether `name` has a live process.
    pub fn is_running(&self, name: &str) -> bool {
        self.inner.running.lock().contains_key(name)
    }

    /// Launch `name`.
    pub async fn launch(&self, name: &str) -> Result<LaunchOutcome> {
        self.ensure_restart_worker();
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.launch_locked(name, 0).await
    }

    /// Stop `name`: proxy first, then the process, then release the port.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stop_locked(name).await
    }

    /// Stop `name` if running, re-read its declaration, and launch it.
    pub async fn reload(&self, name: &str) -> Result<LaunchOutcome> {
        self.ensure_restart_worker();
        let _guard = self.inner.lifecycle.lock().await;
        match self.inner.stop_locked(name).await {
            Ok(()) | Err(ChildError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }

        let dir = self.children_dir().join(name);
        match load_spec(&dir) {
            Ok(spec) => {
                let _ = self.inner.specs.write().insert(name.to_string(), spec);
            }
            Err(e) => {
                let _ = self.inner.specs.write().remove(name);
                return Err(e);
            }
        }
        info!(child = name, "declaration reloaded");
        self.inner.launch_locked(name, 0).await
    }

    /// Launch every discovered `startup = true` child, in discovery order.
    ///
    /// Failures are logged per child. Returns the names that launched.
    pub async fn autostart(&self) -> Vec<String> {
        let candidates: Vec<String> = self
            .inner
            .specs
            .read()
            .values()
            .filter(|s| s.startup)
            .map(|s| s.name.clone())
            .collect();

        let mut launched = Vec::new();
        for name in candidates {
            match self.launch(&name).await {
                Ok(LaunchOutcome::Launched { .. }) => launched.push(name),
                Ok(LaunchOutcome::Incompatible) => {}
                Err(e) => warn!(child = %name, error = %e, "autostart failed"),
            }
        }
        launched
    }

    /// Discover, then autostart when enabled. Runs once per manager; later
    /// calls are no-ops.
    pub async fn boot(&self) -> Vec<String> {
        if self.inner.booted.swap(true, Ordering::SeqCst) {
            debug!("children already booted");
            return Vec::new();
        }
        let _ = self.discover();
        if !self.inner.options.children.autostart {
            info!("autostart disabled, children left stopped");
            return Vec::new();
        }
        self.autostart().await
    }

    /// Forward an upstream frame to every running child's proxy.
    ///
    /// Returns how many child connections accepted it.
    pub fn broadcast(&self, frame: &str) -> usize {
        let proxies: Vec<Arc<ForwardingProxy>> = self
            .inner
            .running
            .lock()
            .values()
            .map(|c| Arc::clone(&c.proxy))
            .collect();
        proxies.iter().map(|p| p.send_to_children(frame)).sum()
    }

    /// Stop every child concurrently and shut the restart worker down.
    pub async fn stop_all(&self) {
        self.inner.cancel.cancel();
        let _guard = self.inner.lifecycle.lock().await;
        let children: Vec<ChildProcess> = self.inner.running.lock().drain().map(|(_, c)| c).collect();
        if children.is_empty() {
            return;
        }
        info!(count = children.len(), "stopping all children");
        let inner = &self.inner;
        let _ = futures::future::join_all(children.into_iter().map(|c| inner.shutdown_process(c))).await;
    }

    fn ensure_restart_worker(&self) {
        let Some(rx) = self.inner.exits_rx.lock().take() else {
            return;
        };
        drop(tokio::spawn(run_restart_worker(Arc::clone(&self.inner), rx)));
    }
}

impl Inner {
    async fn launch_locked(&self, name: &str, restarts: u32) -> Result<LaunchOutcome> {
        if self.running.lock().contains_key(name) {
            return Err(ChildError::AlreadyRunning(name.to_string()));
        }
        let spec = self
            .specs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ChildError::NotFound(name.to_string()))?;

        match check_compatible(&self.manager_version, &spec.compatible_versions) {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    child = name,
                    manager_version = %self.manager_version,
                    ranges = ?spec.compatible_versions,
                    "child incompatible with this manager, not launching"
                );
                return Ok(LaunchOutcome::Incompatible);
            }
            Err(e) => {
                warn!(child = name, error = %e, "unparseable compatibility range, not launching");
                return Ok(LaunchOutcome::Incompatible);
            }
        }

        let ports = Arc::clone(&self.ports);
        let acquired = tokio::task::spawn_blocking(move || ports.acquire())
            .await
            .unwrap_or_else(|e| {
                warn!(child = name, error = %e, "port allocation task failed");
                None
            });
        let Some(port) = acquired else {
            error!(child = name, "no free port for child proxy");
            return Err(ChildError::PortsExhausted);
        };
        let token = generate_token();

        let proxy = Arc::new(ForwardingProxy::new(
            name,
            port,
            token.clone(),
            self.options.proxy.clone(),
        ));
        if let Some(handler) = self.handler.read().clone() {
            proxy.set_message_handler(handler);
        }
        if let Err(e) = proxy.start().await {
            self.ports.release(port);
            return Err(e.into());
        }

        let runtime = self.options.children.runtime.as_deref();
        let child = match process::spawn(&spec, runtime, port, &token) {
            Ok(child) => child,
            Err(source) => {
                proxy.stop().await;
                self.ports.release(port);
                return Err(ChildError::Spawn {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let pid = child.id();
        let process: ProcessHandle = Arc::new(Mutex::new(child));
        let launch_id = Uuid::now_v7();
        let watch_cancel = self.cancel.child_token();
        drop(tokio::spawn(process::watch(
            ExitNotice {
                name: name.to_string(),
                launch_id,
            },
            Arc::clone(&process),
            secs(self.options.children.monitor_interval_secs),
            self.exits_tx.clone(),
            watch_cancel.clone(),
        )));

        let _ = self.running.lock().insert(
            name.to_string(),
            ChildProcess {
                launch_id,
                spec,
                port,
                pid,
                process,
                proxy,
                started_at: Utc::now(),
                restarts,
                watch_cancel,
            },
        );
        info!(
            child = name,
            port,
            pid,
            restarts,
            ports_in_use = self.ports.allocated_count(),
            "child launched"
        );
        Ok(LaunchOutcome::Launched { port })
    }

    async fn stop_locked(&self, name: &str) -> Result<()> {
        let child = self
            .running
            .lock()
            .remove(name)
            .ok_or_else(|| ChildError::NotRunning(name.to_string()))?;
        self.shutdown_process(child).await;
        Ok(())
    }

    async fn shutdown_process(&self, child: ChildProcess) {
        let name = child.spec.name.as_str();
        child.watch_cancel.cancel();
        child.proxy.stop().await;
        process::terminate(name, &child.process, TERMINATE_GRACE).await;
        self.ports.release(child.port);
        info!(child = name, port = child.port, "child stopped");
    }

    async fn restart(&self, notice: ExitNotice) {
        let _guard = self.lifecycle.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }

        let restarts = {
            let running = self.running.lock();
            match running.get(&notice.name) {
                Some(child) if child.launch_id == notice.launch_id => child.restarts,
                _ => {
                    debug!(child = %notice.name, "stale exit notice ignored");
                    return;
                }
            }
        };

        if let Err(e) = self.stop_locked(&notice.name).await {
            debug!(child = %notice.name, error = %e, "stop before restart failed");
        }

        let next = restarts.saturating_add(1);
        if let Some(max) = self.options.children.max_restarts {
            if next > max {
                error!(child = %notice.name, max_restarts = max, "restart limit reached, leaving child stopped");
                return;
            }
        }

        info!(child = %notice.name, attempt = next, "restarting child");
        match self.launch_locked(&notice.name, next).await {
            Ok(LaunchOutcome::Launched { .. }) => {}
            Ok(LaunchOutcome::Incompatible) => {
                warn!(child = %notice.name, "child no longer compatible, not restarted");
            }
            Err(e) => error!(child = %notice.name, error = %e, "restart failed"),
        }
    }
}

async fn run_restart_worker(inner: Arc<Inner>, mut exits: mpsc::UnboundedReceiver<ExitNotice>) {
    loop {
        tokio::select! {
            notice = exits.recv() => {
                let Some(notice) = notice else { break };
                inner.restart(notice).await;
            }
            () = inner.cancel.cancelled() => break,
        }
    }
    debug!("restart worker stopped");
}
