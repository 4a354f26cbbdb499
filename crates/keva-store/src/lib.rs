//! # keva-store
//!
//! Storage backends and advisory coordination for
//! [`keva-migrate`](https://docs.rs/keva-migrate).
//!
//! ## Backends
//!
//! | Backend | Feature | Persistence | Notes |
//! |---------|---------|-------------|-------|
//! | [`MemoryStore`] | always | none | tests, prototyping |
//! | [`SqliteStore`] | `sqlite` (default) | file or `:memory:` | WAL mode, bundled SQLite |
//!
//! Both implement [`keva_migrate::VersionedStore`]: each declared version
//! upgrade is all-or-nothing, and committed versions are never re-run.
//!
//! ## Coordination
//!
//! [`LockCoordinator`] layers a best-effort migration lock over a
//! [`MigrationTopic`]; [`LocalBus`] provides the in-process transport.
//! The lock is advisory — correctness always rests on the store's
//! transactional version guard.
//!
//! ## Drift detection
//!
//! [`write_snapshot`] / [`read_snapshot`] persist a schema snapshot to a
//! JSON file; [`check_drift`] and [`diff_against_file`] compare a live
//! store against the declared schema or a stored baseline.

mod bus;
mod coordinator;
mod drift;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use bus::{LocalBus, LockMessage, MigrationTopic, TopicSubscription};
pub use coordinator::{CoordinationError, CoordinatorConfig, LockCoordinator};
pub use drift::{
    check_drift, diff_against_file, read_snapshot, write_snapshot, CheckError, DriftError,
};
pub use memory::{MemoryError, MemoryStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{JournalMode, SqliteConfig, SqliteError, SqliteStore};
