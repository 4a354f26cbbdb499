//! The version applier: folds an ordered migration set into a store.
//!
//! `run` drives the whole lifecycle: sequence the set, discover what was
//! already applied from the tracking table, declare the full version chain
//! (every version carries the cumulative schema, only pending ones carry an
//! upgrade step), and open the store through it. Atomicity of each step is
//! delegated to the store's per-version transactional upgrade guarantee.
//!
//! # Example
//!
//! ```
//! use keva_migrate::{run, ApplyOptions, Migration};
//! use keva_store::MemoryStore;
//!
//! let migrations = vec![Migration::new(1, "init").with_store("users", "id,email")];
//! let mut store = MemoryStore::new();
//!
//! let report = run(&mut store, &migrations, ApplyOptions::default()).unwrap();
//! assert_eq!(report.applied, vec![1]);
//! assert_eq!(report.final_version, 1);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::migration::{now_ms, AppliedRecord, Migration, TRACKING_TABLE};
use crate::schema::TableSchema;
use crate::sequence::{sequence, version_for_position, SequenceError};
use crate::spec::SpecError;
use crate::store::{OpenError, UpgradeError, UpgradeFn, VersionDecl, VersionedStore};

/// Progress callback: `(ordinal, total_pending)`, fired once per pending
/// migration before its transform runs.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Error callback: the failing migration and the error text, fired once
/// before the error propagates to the caller.
pub type ErrorFn = Arc<dyn Fn(&Migration, &str) + Send + Sync>;

/// Completion callback, fired once after every declared version has been
/// attempted without fatal error.
pub type CompleteFn = Arc<dyn Fn() + Send + Sync>;

/// Options for [`run`]. Callbacks are notification-only: they never alter
/// control flow.
#[derive(Default, Clone)]
pub struct ApplyOptions {
    /// Report intended work without touching the store.
    pub dry_run: bool,
    pub on_progress: Option<ProgressFn>,
    pub on_error: Option<ErrorFn>,
    pub on_complete: Option<CompleteFn>,
}

impl fmt::Debug for ApplyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyOptions")
            .field("dry_run", &self.dry_run)
            .field("on_progress", &self.on_progress.as_ref().map(|_| "<fn>"))
            .field("on_error", &self.on_error.as_ref().map(|_| "<fn>"))
            .field("on_complete", &self.on_complete.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ApplyOptions {
    /// A dry run: discover and report, mutate nothing.
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn on_progress(mut self, f: ProgressFn) -> Self {
        self.on_progress = Some(f);
        self
    }

    pub fn on_error(mut self, f: ErrorFn) -> Self {
        self.on_error = Some(f);
        self
    }

    pub fn on_complete(mut self, f: CompleteFn) -> Self {
        self.on_complete = Some(f);
        self
    }
}

/// Outcome of a [`run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Ids applied by this run, in application order. Empty on dry runs.
    pub applied: Vec<u64>,
    /// Ids of the passed-in set that were already recorded as applied.
    pub skipped: Vec<u64>,
    /// On a dry run, the ids that would be applied. Empty otherwise.
    pub pending: Vec<u64>,
    /// Number of declared versions (the length of the sequenced set).
    pub final_version: u32,
}

/// Why a [`run`] failed.
#[derive(Debug)]
pub enum ApplyError<E> {
    /// The migration set is malformed. Nothing touched the store.
    Sequence(SequenceError),
    /// A migration declares an unparseable table specification.
    Spec(SpecError),
    /// The tracking table holds a row that is not an applied record.
    Tracking(String),
    /// A pending migration maps to a version the store already committed.
    /// Happens when a recorded migration is removed from the set, shifting
    /// later positions backwards. Nothing touched the store.
    VersionConflict { id: u64, version: u32, current: u32 },
    /// Backend failure outside any upgrade step.
    Store(E),
    /// An upgrade step aborted; its version did not commit, earlier
    /// versions stay durable.
    Upgrade { version: u32, source: UpgradeError },
}

impl<E: fmt::Display> fmt::Display for ApplyError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequence(e) => write!(f, "{e}"),
            Self::Spec(e) => write!(f, "{e}"),
            Self::Tracking(msg) => write!(f, "corrupt tracking table: {msg}"),
            Self::VersionConflict { id, version, current } => write!(
                f,
                "pending migration {id} maps to version {version}, but the store already \
                 committed version {current}; a recorded migration is missing from the set"
            ),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Upgrade { version, source } => {
                write!(f, "migration to version {version} failed: {source}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ApplyError<E> {}

impl<E> From<SequenceError> for ApplyError<E> {
    fn from(e: SequenceError) -> Self {
        Self::Sequence(e)
    }
}

impl<E> From<SpecError> for ApplyError<E> {
    fn from(e: SpecError) -> Self {
        Self::Spec(e)
    }
}

/// Shape of the tracking table, declared in every version.
fn tracking_schema() -> TableSchema {
    TableSchema {
        name: TRACKING_TABLE.to_string(),
        primary_key: "id".to_string(),
        indexes: vec!["applied_at".to_string()],
        auto_increment: false,
    }
}

/// Apply a migration set to a store.
///
/// See the module docs for the full lifecycle. Failure semantics: versions
/// that committed before the failure remain durable, the failing version
/// leaves no trace, and nothing is retried.
pub fn run<S: VersionedStore>(
    store: &mut S,
    migrations: &[Migration],
    options: ApplyOptions,
) -> Result<MigrationReport, ApplyError<S::Error>> {
    let ordered = sequence(migrations)?;
    let final_version = ordered.len() as u32;

    // Discover history. A store or table that does not exist yet reads as
    // empty: a fresh install, not an error.
    let mut recorded = BTreeSet::new();
    for (key, doc) in store.read_table(TRACKING_TABLE).map_err(ApplyError::Store)? {
        let record: AppliedRecord = serde_json::from_value(doc)
            .map_err(|e| ApplyError::Tracking(format!("row `{key}`: {e}")))?;
        recorded.insert(record.id);
    }

    let pending: Vec<u64> = ordered
        .iter()
        .map(|m| m.id)
        .filter(|id| !recorded.contains(id))
        .collect();
    let skipped: Vec<u64> = ordered
        .iter()
        .map(|m| m.id)
        .filter(|id| recorded.contains(id))
        .collect();

    // A pending migration whose positional version the store already
    // committed would be silently skipped by the backend. That only
    // happens when a recorded migration was removed from the set; refuse
    // rather than report phantom work.
    let current = store.current_version().map_err(ApplyError::Store)?;
    for (position, migration) in ordered.iter().enumerate() {
        let version = version_for_position(position);
        if !recorded.contains(&migration.id) && version <= current {
            return Err(ApplyError::VersionConflict {
                id: migration.id,
                version,
                current,
            });
        }
    }

    if options.dry_run {
        return Ok(MigrationReport {
            applied: Vec::new(),
            skipped,
            pending,
            final_version,
        });
    }

    let total_pending = pending.len();
    let mut declarations = Vec::with_capacity(ordered.len());
    let mut folded: BTreeMap<String, String> = BTreeMap::new();
    let mut ordinal = 0usize;

    for (position, migration) in ordered.iter().enumerate() {
        if let Some(stores) = &migration.stores {
            for (table, spec) in stores {
                match spec {
                    Some(spec) => {
                        folded.insert(table.clone(), spec.clone());
                    }
                    None => {
                        folded.remove(table);
                    }
                }
            }
        }

        let mut tables = BTreeMap::new();
        for (table, spec) in &folded {
            tables.insert(table.clone(), TableSchema::from_spec(table, spec)?);
        }
        tables.insert(TRACKING_TABLE.to_string(), tracking_schema());

        let upgrade = if recorded.contains(&migration.id) {
            None
        } else {
            ordinal += 1;
            Some(upgrade_step(
                migration.clone(),
                ordinal,
                total_pending,
                &options,
            ))
        };

        declarations.push(VersionDecl {
            version: version_for_position(position),
            tables,
            upgrade,
        });
    }

    store.open(declarations).map_err(|e| match e {
        OpenError::Backend(e) => ApplyError::Store(e),
        OpenError::Upgrade { version, source } => ApplyError::Upgrade { version, source },
    })?;

    if let Some(on_complete) = &options.on_complete {
        on_complete();
    }

    Ok(MigrationReport {
        applied: pending,
        skipped,
        pending: Vec::new(),
        final_version,
    })
}

/// Build the upgrade callback for one pending migration: transform, then
/// validate, then record — all in the version's transaction.
fn upgrade_step(
    migration: Migration,
    ordinal: usize,
    total_pending: usize,
    options: &ApplyOptions,
) -> UpgradeFn {
    let on_progress = options.on_progress.clone();
    let on_error = options.on_error.clone();

    Box::new(move |tx| {
        if let Some(on_progress) = &on_progress {
            on_progress(ordinal, total_pending);
        }

        let step = (|| -> Result<(), UpgradeError> {
            if let Some(hooks) = &migration.hooks {
                hooks.transform(tx).map_err(|source| UpgradeError::Transform {
                    id: migration.id,
                    source,
                })?;

                match hooks.validate(tx) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(UpgradeError::ValidationFailed {
                            id: migration.id,
                            reason: "validate returned false".to_string(),
                        })
                    }
                    Err(e) => {
                        return Err(UpgradeError::ValidationFailed {
                            id: migration.id,
                            reason: e.to_string(),
                        })
                    }
                }
            }

            let record = AppliedRecord {
                id: migration.id,
                name: migration.name.clone(),
                applied_at: now_ms(),
            };
            let doc = serde_json::to_value(&record)
                .map_err(|e| UpgradeError::Record(e.to_string()))?;
            tx.put(TRACKING_TABLE, &migration.id.to_string(), doc)?;
            Ok(())
        })();

        if let Err(e) = &step {
            if let Some(on_error) = &on_error {
                on_error(&migration, &e.to_string());
            }
        }
        step
    })
}
