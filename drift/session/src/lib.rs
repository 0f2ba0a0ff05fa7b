//! The user daemon session (spec §2-§5): the long-lived component that
//! ensures agents, tracks intercepts, runs the manager watchers, and
//! reconciles per-pod forward/mount groups.

pub mod agents;
pub mod dial_watcher;
pub mod error;
pub mod forwarder;
pub mod intercepts;
pub mod manager;
pub mod metrics;
pub mod mount;
pub mod reconciler;
pub mod root_daemon;
pub mod session;
pub mod token_cache;
mod waiter;

pub use error::SessionError;
pub use root_daemon::{DisabledRootDaemon, DnsConfig, OutboundInfo, RootDaemonClient, RootDaemonError};
pub use session::{ConnectParams, InterceptSpecInput, Session, SessionEndReason};
pub use token_cache::TokenCache;
