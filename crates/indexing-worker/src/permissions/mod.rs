pub mod runner;
pub mod store;
pub mod sync_params;

pub use runner::{DocSyncRunner, PermissionSyncScheduler};
pub use store::PermissionStore;
pub use sync_params::{sync_config_for, DocSyncConfig, GroupSyncConfig, SyncConfig};
