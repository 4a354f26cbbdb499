//! # keva-migrate
//!
//! Declarative, replayable schema migrations for embedded versioned
//! key-value stores.
//!
//! A schema is described as an ordered set of [`Migration`] values. Each
//! one assigns tables a full index specification string (or deletes them)
//! and may carry a data transform and a validation check. Applying the set
//! folds it into successive store versions:
//!
//! 1. The set is validated and ordered by ascending id ([`sequence`]).
//! 2. Already-applied ids are discovered from the tracking table.
//! 3. The store is opened through the full version chain; pending versions
//!    run their transform, validate, and history record inside one
//!    transaction each ([`run`]).
//!
//! On top of that sit drift detection ([`snapshot`], [`validate_schema`],
//! [`compare_snapshots`]) and history compaction ([`squash_migrations`]).
//!
//! Storage backends live in [`keva-store`](https://docs.rs/keva-store) and
//! implement the [`VersionedStore`] trait; cross-process coordination for
//! migration runs lives there too.
//!
//! ## Key properties
//!
//! - **Positional versions**: the i-th migration in sorted order maps to
//!   version `i + 1`; gaps in ids do not create version gaps.
//! - **Replayable**: re-applying a set is a no-op for recorded ids, and a
//!   set's end-state schema is a pure, order-independent fold.
//! - **Advisory coordination only**: locking between processes is
//!   best-effort broadcast signaling, not consensus.

mod apply;
mod migration;
mod schema;
mod sequence;
mod spec;
mod squash;
mod store;

pub use apply::{
    ApplyError, ApplyOptions, CompleteFn, ErrorFn, MigrationReport, ProgressFn, run,
};
pub use migration::{
    AppliedRecord, HookError, Migration, MigrationHooks, INTERNAL_TABLE_PREFIX, TRACKING_TABLE,
};
pub use schema::{
    compare_snapshots, expected_schema, snapshot, validate_schema, SchemaSnapshot, SnapshotDiff,
    TableSchema, ValidationResult,
};
pub use sequence::{sequence, version_for_position, SequenceError};
pub use spec::{parse_table_spec, spec_field_names, IndexSpec, ParsedSpec, SpecError};
pub use squash::{
    renumber_migrations, squash_migrations, validate_squash, ConcatenatedTransforms, SquashError,
    SquashOptions, SquashOutcome, SquashReport, TransformHandling,
};
pub use store::{
    Document, OpenError, StoreTxn, TxnError, UpgradeError, UpgradeFn, VersionDecl, VersionedStore,
};
