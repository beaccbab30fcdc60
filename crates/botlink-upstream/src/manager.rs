//! Connection manager: owns every account, runs the health monitor, and
//! publishes the active account.
//!
//! The active slot is an `RwLock<Option<Arc<AccountConnection>>>` held only
//! for the swap itself. The active-changed callback always runs after the
//! lock is released, once per actual change.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use botlink_core::clock::unix_now;
use botlink_settings::{AccountSpec, UpstreamSettings, secs};

use crate::account::{AccountConnection, AccountId, AccountStatus, HealthTransition};
use crate::election::{ElectionDecision, best_candidate, decide};
use crate::errors::{Result, UpstreamError};
use crate::session::run_account_loop;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const MIN_TICK: Duration = Duration::from_millis(1);

/// Receives every inbound frame from any upstream account.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handle one text frame received on `account`.
    async fn handle_frame(&self, account: &Arc<AccountConnection>, frame: String);
}

/// Invoked with the new active account after each change.
pub type ActiveChangedCallback = Arc<dyn Fn(Arc<AccountConnection>) + Send + Sync>;

/// Manages all upstream accounts.
pub struct ConnectionManager {
    accounts: Vec<Arc<AccountConnection>>,
    active: RwLock<Option<Arc<AccountConnection>>>,
    on_active_changed: RwLock<Option<ActiveChangedCallback>>,
    no_account_reported: AtomicBool,
    monitor_interval: Duration,
    connect_timeout: Duration,
}

impl ConnectionManager {
    /// Create an empty manager.
    pub fn new(settings: &UpstreamSettings) -> Self {
        Self {
            accounts: Vec::new(),
            active: RwLock::new(None),
            on_active_changed: RwLock::new(None),
            no_account_reported: AtomicBool::new(false),
            monitor_interval: secs(settings.monitor_interval_secs),
            connect_timeout: secs(settings.connect_timeout_secs),
        }
    }

    /// Register accounts in configuration order.
    ///
    /// Accounts without an id get `max(configured ids) + 1`, increasing in
    /// order. Every account starts disconnected with its heartbeat timestamp
    /// set to now.
    pub fn configure(&mut self, specs: &[AccountSpec]) {
        let now = unix_now();
        let mut next_id = specs
            .iter()
            .filter_map(|s| s.id)
            .max()
            .map_or(1, |max| max.saturating_add(1));

        self.accounts = specs
            .iter()
            .map(|spec| {
                let id = spec.id.unwrap_or_else(|| {
                    let id = next_id;
                    next_id = next_id.saturating_add(1);
                    id
                });
                debug!(account_id = id, priority = spec.priority, endpoint = %spec.endpoint_uri, "account configured");
                Arc::new(AccountConnection::new(id, spec, now))
            })
            .collect();
    }

    /// Register the active-changed callback, replacing any previous one.
    pub fn set_active_changed_callback(&self, callback: ActiveChangedCallback) {
        *self.on_active_changed.write() = Some(callback);
    }

    /// Currently active account, if any.
    pub fn active(&self) -> Option<Arc<AccountConnection>> {
        self.active.read().clone()
    }

    /// Look up an account by id.
    pub fn account(&self, id: AccountId) -> Option<Arc<AccountConnection>> {
        self.accounts.iter().find(|a| a.id() == id).cloned()
    }

    /// Snapshot of every account in configuration order.
    pub fn statuses(&self) -> Vec<AccountStatus> {
        self.accounts.iter().map(|a| a.status()).collect()
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Apply a heartbeat to the named account.
    ///
    /// Returns `false` when no such account exists.
    pub fn report_heartbeat(
        &self,
        id: AccountId,
        good: bool,
        online: bool,
        interval_ms: Option<f64>,
    ) -> bool {
        let Some(account) = self.account(id) else {
            return false;
        };
        let interval_secs = interval_ms.map(|ms| ms / 1000.0);
        if account.record_heartbeat(unix_now(), good, online, interval_secs) {
            info!(account_id = id, "account healthy again");
        } else if !(good && online) {
            debug!(account_id = id, good, online, "heartbeat reports degraded account");
        }
        true
    }

    /// Send a frame on the active account.
    ///
    /// Returns the id of the account the frame was queued on.
    pub fn send(&self, frame: String) -> Result<AccountId> {
        let account = self.active().ok_or(UpstreamError::NoActiveAccount)?;
        account.send(frame)?;
        Ok(account.id())
    }

    /// Publish `account` if the slot is empty and it is the best candidate.
    pub(crate) fn claim_if_vacant(&self, account: &Arc<AccountConnection>) {
        {
            let mut slot = self.active.write();
            if slot.is_some() || best_candidate(&self.statuses()) != Some(account.id()) {
                return;
            }
            *slot = Some(Arc::clone(account));
        }
        self.no_account_reported.store(false, Ordering::Relaxed);
        info!(account_id = account.id(), priority = account.priority(), "active account published");
        self.notify(account);
    }

    /// One health-monitor round at wall-clock time `now`.
    ///
    /// Re-evaluates health for every connected account, then runs the
    /// election and applies its decision.
    pub fn monitor_tick(&self, now: f64) -> ElectionDecision {
        for account in &self.accounts {
            match account.apply_health(now) {
                HealthTransition::Unchanged => {}
                HealthTransition::BecameUnhealthy { elapsed } => warn!(
                    account_id = account.id(),
                    silent_secs = elapsed,
                    "heartbeat overdue, marking account unhealthy"
                ),
                HealthTransition::SkewReset { delta } => warn!(
                    account_id = account.id(),
                    delta_secs = delta,
                    "implausible heartbeat delta, resetting timestamp"
                ),
            }
        }

        let statuses = self.statuses();
        let previous = self.active().map(|a| a.id());
        let decision = decide(previous, &statuses);
        match decision {
            ElectionDecision::Keep => {
                if previous.is_none() && statuses.iter().all(|s| !s.is_available()) {
                    self.report_no_account();
                }
            }
            ElectionDecision::Switch(id) => {
                if let Some(account) = self.account(id) {
                    self.publish(&account, previous);
                }
            }
            ElectionDecision::Clear => {
                *self.active.write() = None;
                self.report_no_account();
            }
        }
        decision
    }

    /// Start every account loop plus the monitor, and run until `cancel`.
    pub async fn start(self: &Arc<Self>, handler: Arc<dyn FrameHandler>, cancel: CancellationToken) {
        if self.accounts.is_empty() {
            warn!("no upstream accounts configured");
        }

        let mut tasks = JoinSet::new();
        for account in &self.accounts {
            let _ = tasks.spawn(run_account_loop(
                Arc::clone(self),
                Arc::clone(account),
                Arc::clone(&handler),
                cancel.clone(),
            ));
        }
        let _ = tasks.spawn(Arc::clone(self).run_monitor(cancel.clone()));

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Err(e)) if e.is_panic() => error!(error = %e, "upstream task panicked"),
                    Some(_) => {}
                    None => break,
                },
                () = cancel.cancelled() => {
                    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                        while tasks.join_next().await.is_some() {}
                    })
                    .await;
                    if drained.is_err() {
                        warn!("upstream tasks did not stop in time, aborting");
                        tasks.abort_all();
                    }
                    break;
                }
            }
        }
        *self.active.write() = None;
        info!("connection manager stopped");
    }

    async fn run_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.monitor_interval.max(MIN_TICK));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.monitor_tick(unix_now());
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    fn publish(&self, account: &Arc<AccountConnection>, previous: Option<AccountId>) {
        {
            let mut slot = self.active.write();
            if slot.as_ref().is_some_and(|a| a.id() == account.id()) {
                return;
            }
            *slot = Some(Arc::clone(account));
        }
        self.no_account_reported.store(false, Ordering::Relaxed);

        match previous {
            Some(from) => {
                let failback = self
                    .account(from)
                    .is_some_and(|prev| prev.is_available() && account.priority() < prev.priority());
                info!(
                    from,
                    to = account.id(),
                    kind = if failback { "failback" } else { "failover" },
                    "active account switched"
                );
            }
            None => info!(account_id = account.id(), "active account published"),
        }
        self.notify(account);
    }

    fn notify(&self, account: &Arc<AccountConnection>) {
        let callback = self.on_active_changed.read().clone();
        if let Some(callback) = callback {
            callback(Arc::clone(account));
        }
    }

    fn report_no_account(&self) {
        if !self.no_account_reported.swap(true, Ordering::Relaxed) && !self.accounts.is_empty() {
            error!("no healthy upstream account available");
        }
    }
}
