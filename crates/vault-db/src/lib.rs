//! vault-db: local-first database and sync layer for note vaults.
//!
//! This crate provides:
//! - A per-vault object store with change events and per-vault write queues
//! - Entity encryption, including sharing transitions and attachment re-keying
//! - Markdown ⇄ rich document conversion and the device write path
//! - Import of vault directories and versioned data migrations
//! - The request/response protocol the execution contexts talk over
//!
//! Everything is wired from one [`VaultContext`]; [`Storages`] holds the
//! per-kind storage services built on top of it.

pub mod content;
pub mod context;
pub mod crypto;
pub mod entity;
pub mod events;
pub mod fs;
pub mod importer;
pub mod io;
pub mod migration;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod reporter;
pub mod store;
pub mod transport;
pub mod vault;
pub mod writer;

pub use content::{Converter, LocalConverter, RichDocument};
pub use context::{Storages, VaultContext};
pub use crypto::{AttachmentReencryptor, KeyRing, SymmetricKey};
pub use entity::{Document, Entity, EntityKind, Folder, Image, Patch};
pub use events::{ChangeKind, EventBus, ProgressKind, Subscription, VaultEvent};
pub use fs::{FileEntry, FileStat, FileSystem, InMemoryFs, WalkEntry};
pub use importer::{DeviceLoader, FsLoader, ImportConfig, Importer, Loader};
pub use migration::{MigrationEngine, MigrationRecord, MigrationState, MigrationVersion};
pub use protocol::{ClientConfig, Envelope, ServiceClient, ServiceHandler, ServiceKey};
pub use queue::{AtomicQueue, ConditionalQueue, VaultQueues};
pub use registry::FilepathRegistry;
pub use store::{
    ChangeFilter, DatabaseSnapshot, EntityStorage, LocalStore, StoreMeta, VaultDatabase,
};
pub use transport::{ChannelPort, MessagePort};
pub use vault::{Vault, VaultKind, VaultRegistry};
