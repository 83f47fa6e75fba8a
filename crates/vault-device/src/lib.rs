//! vault-device library: the device side of a vault.
//!
//! - [`service`]: answers the database's `entity:*`, `project:*` and
//!   `attachment:*` requests against the local filesystem
//! - [`host`]: one vault's database and device service wired together
//! - [`persistence`]: JSON snapshots of vault databases
//! - [`watcher`]: debounced filesystem events, fed back into the importer

pub mod echo;
pub mod host;
pub mod native_fs;
pub mod persistence;
pub mod service;
pub mod watcher;

pub use echo::EchoTracker;
pub use host::{DeviceHost, HostConfig};
pub use native_fs::NativeFs;
pub use persistence::SnapshotStore;
pub use service::{DeviceService, ServiceError};
pub use watcher::{FileEvent, FileEventKind, VaultWatcher};
