//! Control channel between the UI side and the sync worker, plus the
//! connectivity monitor that drives automatic syncing.

mod connectivity;
mod messages;
mod service;
mod status;

pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, MonitorHandle};
pub use messages::{CacheStatus, Command, Reply};
pub use service::{ControlHandle, ControlService};
pub use status::{ConnectionStatus, SyncStatus};
