//! # botlink-children
//!
//! Sub-bot supervision:
//!
//! - [`spec`]: `subbot.json` declarations and directory discovery
//! - [`ports`]: loopback port allocation shared by all proxies
//! - [`token`]: one-time proxy tokens
//! - [`proxy`]: per-child authenticated WebSocket proxy
//! - [`manager`]: [`ChildProcessManager`], launch/stop/reload and crash
//!   restarts
//! - `process`: spawn, output capture and termination of OS processes

#![deny(unsafe_code)]

pub mod errors;
pub mod manager;
pub mod ports;
mod process;
pub mod proxy;
pub mod spec;
pub mod token;

pub use errors::{ChildError, ProxyError, Result};
pub use manager::{
    ChildProcessInfo, ChildProcessManager, ChildStatus, LaunchOutcome, ManagerOptions,
};
pub use ports::PortAllocator;
pub use process::TERMINATE_GRACE;
pub use proxy::{ChildFrameHandler, ForwardingProxy};
pub use spec::{ChildSpec, DECLARATION_FILE};
