//! The versioned-store seam.
//!
//! Backends implement [`VersionedStore`]: a store that is opened through an
//! ordered chain of version declarations, runs each declaration's upgrade
//! callback exactly once (historically, in order), and aborts an open
//! without committing a version whose callback fails. The applier builds
//! the chain; backends own transaction discipline.
//!
//! Rows are schemaless JSON documents addressed by `(table, key)`. Index
//! specifications are declarative metadata the backend records; keva does
//! not query through them.

use std::collections::BTreeMap;
use std::fmt;

use crate::migration::HookError;
use crate::schema::TableSchema;

/// Row document type.
pub type Document = serde_json::Value;

/// Error surfaced by [`StoreTxn`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    /// The named table is not declared in the version being opened.
    MissingTable(String),
    /// Backend-specific failure, type-erased for object safety.
    Backend(String),
}

impl fmt::Display for TxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTable(name) => write!(f, "no such table `{name}`"),
            Self::Backend(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl std::error::Error for TxnError {}

/// Table CRUD available to an upgrade callback.
///
/// All operations are scoped to the transaction of the version being
/// opened: either every change in the version commits, or none do.
pub trait StoreTxn {
    /// Read one row.
    fn get(&self, table: &str, key: &str) -> Result<Option<Document>, TxnError>;

    /// Insert or replace one row.
    fn put(&mut self, table: &str, key: &str, doc: Document) -> Result<(), TxnError>;

    /// Delete one row.
    fn delete(&mut self, table: &str, key: &str) -> Result<(), TxnError>;

    /// All rows of a table in key order.
    fn scan(&self, table: &str) -> Result<Vec<(String, Document)>, TxnError>;

    /// Remove every row of a table.
    fn clear(&mut self, table: &str) -> Result<(), TxnError>;
}

/// Why an upgrade callback aborted its version.
#[derive(Debug)]
pub enum UpgradeError {
    /// The migration's transform failed.
    Transform { id: u64, source: HookError },
    /// The migration's validate hook returned `false` or failed.
    ValidationFailed { id: u64, reason: String },
    /// A transaction operation failed.
    Txn(TxnError),
    /// The applied record could not be encoded.
    Record(String),
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transform { id, source } => {
                write!(f, "transform for migration {id} failed: {source}")
            }
            Self::ValidationFailed { id, reason } => {
                write!(f, "validation for migration {id} failed: {reason}")
            }
            Self::Txn(e) => write!(f, "{e}"),
            Self::Record(msg) => write!(f, "could not record applied migration: {msg}"),
        }
    }
}

impl std::error::Error for UpgradeError {}

impl From<TxnError> for UpgradeError {
    fn from(e: TxnError) -> Self {
        Self::Txn(e)
    }
}

/// Callback run inside the transaction of one pending version.
pub type UpgradeFn = Box<dyn FnOnce(&mut dyn StoreTxn) -> Result<(), UpgradeError> + Send>;

/// One link in the version chain passed to [`VersionedStore::open`].
///
/// `tables` is the *complete* schema at this version, not a delta: the
/// backend reconciles its table set against it (creating, reshaping, and
/// dropping tables) before running `upgrade`.
pub struct VersionDecl {
    /// 1-based version number; declarations are passed in ascending order.
    pub version: u32,
    /// Full table map at this version, tracking table included.
    pub tables: BTreeMap<String, TableSchema>,
    /// Upgrade step, present only for versions not yet applied.
    pub upgrade: Option<UpgradeFn>,
}

impl fmt::Debug for VersionDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionDecl")
            .field("version", &self.version)
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .field("upgrade", &self.upgrade.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Why [`VersionedStore::open`] failed.
#[derive(Debug)]
pub enum OpenError<E> {
    /// Backend failure outside any upgrade callback.
    Backend(E),
    /// The callback for `version` aborted; that version did not commit.
    Upgrade { version: u32, source: UpgradeError },
}

impl<E: fmt::Display> fmt::Display for OpenError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "store error: {e}"),
            Self::Upgrade { version, source } => {
                write!(f, "upgrade to version {version} failed: {source}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for OpenError<E> {}

/// An embedded store with versioned, transactional schema upgrades.
///
/// The contract (treated as trustworthy by the applier):
/// - `current_version` is monotonic and reflects the last committed version.
/// - `open` runs upgrade callbacks for every declared version above the
///   current one, in ascending order, each inside its own transaction.
///   Versions at or below the current one have already run historically
///   and are never re-run.
/// - A failing callback aborts the open; earlier versions stay committed,
///   the failing one leaves no trace.
pub trait VersionedStore {
    /// Backend error type.
    type Error: fmt::Debug + fmt::Display;

    /// Last committed version; 0 for a store never opened.
    fn current_version(&self) -> Result<u32, Self::Error>;

    /// Open through the declared version chain.
    fn open(&mut self, versions: Vec<VersionDecl>) -> Result<(), OpenError<Self::Error>>;

    /// Names of all live tables.
    fn table_names(&self) -> Result<Vec<String>, Self::Error>;

    /// Actual shape of one table, `None` if it does not exist.
    fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, Self::Error>;

    /// All rows of a table, outside any upgrade. A table (or store) that
    /// does not exist yet reads as empty — the fresh-install contract the
    /// applier relies on when discovering applied migrations.
    fn read_table(&self, table: &str) -> Result<Vec<(String, Document)>, Self::Error>;
}
