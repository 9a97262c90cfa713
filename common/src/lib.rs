pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod error;
pub mod link;
#[cfg(test)]
mod sim;
pub mod status;
pub mod storage;
pub mod types;
pub mod update;

/// Version reported by the update info query.
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{
    AccessPointConfig, ConnectivityConfig, IndicatorConfig, RuntimeConfig, UpdateConfig,
};
pub use connectivity::{ConnectivityManager, LinkEventHandler, NetworkDriver, Restarter};
pub use credentials::{CredentialCache, CredentialStore, MemoryCredentialStore};
pub use error::{ConnectivityError, StorageError, StoreError, UpdateError};
pub use link::{LinkAction, LinkStateMachine};
pub use status::{FanoutSink, IndicatorPattern, SharedStatus, StatusSink, SystemStatus};
pub use storage::{FirmwareStorage, RegionWriter};
pub use types::{
    ConnectionState, ConnectivityEvent, Credentials, LinkEvent, NetworkStatus, SessionSnapshot,
    SessionStatus, SessionSummary, StartupMode, StationInfo, StorageRegion, UpdateEvent,
    UpdateInfo,
};
pub use update::UpdatePipeline;
