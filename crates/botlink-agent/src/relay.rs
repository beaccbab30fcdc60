//! Frame relay between upstream accounts and child programs.
//!
//! Upstream frames feed heartbeats into the connection manager and, when
//! they arrive on the active account, are broadcast to every child. Child
//! frames are sent out on whichever account is active at that moment.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use botlink_children::{ChildFrameHandler, ChildProcessManager};
use botlink_core::protocol::HeartbeatEvent;
use botlink_upstream::{AccountConnection, ActiveChangedCallback, ConnectionManager, FrameHandler};

/// Handles frames coming from upstream accounts.
pub struct UpstreamRelay {
    manager: Arc<ConnectionManager>,
    children: Option<ChildProcessManager>,
}

impl UpstreamRelay {
    /// Relay to `children`, or only track heartbeats when `None`.
    pub fn new(manager: Arc<ConnectionManager>, children: Option<ChildProcessManager>) -> Self {
        Self { manager, children }
    }

    fn record_heartbeat(&self, account: &AccountConnection, heartbeat: &HeartbeatEvent) {
        // Prefer the id the upstream reports; fall back to the receiving account.
        let reported = heartbeat.self_id.filter(|id| self.manager.account(*id).is_some());
        let id = reported.unwrap_or_else(|| account.id());
        let _ = self
            .manager
            .report_heartbeat(id, heartbeat.good, heartbeat.online, heartbeat.interval_ms);
    }
}

#[async_trait]
impl FrameHandler for UpstreamRelay {
    async fn handle_frame(&self, account: &Arc<AccountConnection>, frame: String) {
        if let Some(heartbeat) = HeartbeatEvent::from_text(&frame) {
            self.record_heartbeat(account, &heartbeat);
        }

        let is_active = self.manager.active().is_some_and(|a| a.id() == account.id());
        if !is_active {
            return;
        }
        if let Some(children) = &self.children {
            let delivered = children.broadcast(&frame);
            debug!(account_id = account.id(), delivered, "upstream frame relayed to children");
        }
    }
}

/// Handles frames coming from children.
pub struct ChildRelay {
    manager: Arc<ConnectionManager>,
}

impl ChildRelay {
    /// Relay child frames to the active account of `manager`.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ChildFrameHandler for ChildRelay {
    async fn handle_child_frame(&self, child: &str, frame: String) {
        match self.manager.send(frame) {
            Ok(account_id) => debug!(child, account_id, "child frame relayed upstream"),
            Err(e) => warn!(child, error = %e, "dropping child frame"),
        }
    }
}

/// Callback that boots the children the first time an account goes active.
///
/// Later activations are no-ops because [`ChildProcessManager::boot`] only
/// runs once.
pub fn boot_on_first_activation(children: ChildProcessManager) -> ActiveChangedCallback {
    Arc::new(move |account: Arc<AccountConnection>| {
        let children = children.clone();
        drop(tokio::spawn(async move {
            let launched = children.boot().await;
            if !launched.is_empty() {
                info!(account_id = account.id(), ?launched, "children started");
            }
        }));
    })
}
