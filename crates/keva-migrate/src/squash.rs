//! History compaction: squash a migration prefix into one base migration.
//!
//! Squashing folds every migration at or below a cutoff id into a single
//! synthetic migration carrying the folded schema. It is deliberately
//! lossy: validate and rollback hooks of the prefix are always dropped,
//! and transforms are dropped too unless the caller opts into the fenced
//! [`TransformHandling::UnsafeConcatenate`] path.

use std::fmt;
use std::sync::Arc;

use crate::migration::{HookError, Migration, MigrationHooks};
use crate::schema::expected_schema;
use crate::store::StoreTxn;

/// Default name for the synthetic base migration.
const DEFAULT_BASE_NAME: &str = "squashed_base";

/// What to do with transform hooks found in the squashed prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformHandling {
    /// Drop them. The base migration is schema-only. Safe default: a fresh
    /// install of the squashed set produces the same schema as the
    /// original set, and existing stores never re-run the prefix anyway.
    #[default]
    Discard,
    /// Concatenate them, in original order, into one combined transform.
    ///
    /// Unsafe: validate and rollback hooks are still dropped, and a
    /// transform written against an intermediate partial schema may not
    /// behave the same when run against the folded end-state schema.
    UnsafeConcatenate,
}

/// Options for [`squash_migrations`].
#[derive(Debug, Clone, Default)]
pub struct SquashOptions {
    /// Migrations with `id <= cutoff_id` are squashed.
    pub cutoff_id: u64,
    /// Name for the base migration; defaults to `"squashed_base"`.
    pub base_name: Option<String>,
    /// Transform policy; defaults to [`TransformHandling::Discard`].
    pub transforms: TransformHandling,
}

impl SquashOptions {
    /// Squash everything at or below `cutoff_id` with safe defaults.
    pub fn up_to(cutoff_id: u64) -> Self {
        Self {
            cutoff_id,
            ..Self::default()
        }
    }
}

/// Result of a squash.
#[derive(Debug, Clone)]
pub struct SquashOutcome {
    /// The synthetic replacement migration; always `id = 1`.
    pub base: Migration,
    /// Migrations above the cutoff, untouched.
    pub remaining: Vec<Migration>,
    /// Ids that were folded into the base, ascending.
    pub squashed_ids: Vec<u64>,
}

/// Squash failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SquashError {
    /// No migration has an id at or below the cutoff.
    NoMigrationsToSquash { cutoff_id: u64 },
}

impl fmt::Display for SquashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMigrationsToSquash { cutoff_id } => {
                write!(f, "no migrations to squash at or below id {cutoff_id}")
            }
        }
    }
}

impl std::error::Error for SquashError {}

/// Advisory report from [`validate_squash`]. Never blocks a squash.
#[derive(Debug, Clone)]
pub struct SquashReport {
    /// Always true — squashing is allowed even when lossy.
    pub valid: bool,
    pub warnings: Vec<String>,
}

/// The combined transform produced by
/// [`TransformHandling::UnsafeConcatenate`].
///
/// Replays each source transform in original id order. Validate and
/// rollback are intentionally absent: `validate` always passes and the
/// capability probes report only `transform`.
pub struct ConcatenatedTransforms {
    parts: Vec<(u64, Arc<dyn MigrationHooks>)>,
}

impl ConcatenatedTransforms {
    fn new(parts: Vec<(u64, Arc<dyn MigrationHooks>)>) -> Self {
        Self { parts }
    }

    /// Number of source transforms folded in.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether any source transform is present.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl MigrationHooks for ConcatenatedTransforms {
    fn transform(&self, tx: &mut dyn StoreTxn) -> Result<(), HookError> {
        for (id, hooks) in &self.parts {
            hooks
                .transform(tx)
                .map_err(|e| HookError(format!("squashed transform (origin id {id}): {e}")))?;
        }
        Ok(())
    }

    fn has_transform(&self) -> bool {
        !self.parts.is_empty()
    }
}

/// Compact every migration with `id <= cutoff_id` into one base migration.
///
/// The base migration's `stores` map is the schema fold of the prefix, its
/// id is 1 by convention (the squashed result always becomes the new first
/// migration), and the remainder of the set passes through unchanged.
pub fn squash_migrations(
    migrations: &[Migration],
    options: &SquashOptions,
) -> Result<SquashOutcome, SquashError> {
    let mut ordered = migrations.to_vec();
    ordered.sort_by_key(|m| m.id);

    let (to_squash, to_keep): (Vec<Migration>, Vec<Migration>) = ordered
        .into_iter()
        .partition(|m| m.id <= options.cutoff_id);

    if to_squash.is_empty() {
        return Err(SquashError::NoMigrationsToSquash {
            cutoff_id: options.cutoff_id,
        });
    }

    let folded = expected_schema(&to_squash);
    let squashed_ids: Vec<u64> = to_squash.iter().map(|m| m.id).collect();

    let name = options
        .base_name
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE_NAME.to_string());
    let mut base = Migration::new(1, &name);
    base.stores = Some(
        folded
            .into_iter()
            .map(|(table, spec)| (table, Some(spec)))
            .collect(),
    );

    if options.transforms == TransformHandling::UnsafeConcatenate {
        let parts: Vec<(u64, Arc<dyn MigrationHooks>)> = to_squash
            .iter()
            .filter(|m| m.has_transform())
            .filter_map(|m| m.hooks.clone().map(|h| (m.id, h)))
            .collect();
        if !parts.is_empty() {
            base.hooks = Some(Arc::new(ConcatenatedTransforms::new(parts)));
        }
    }

    Ok(SquashOutcome {
        base,
        remaining: to_keep,
        squashed_ids,
    })
}

/// Warn about behavior a squash at `cutoff_id` would discard or merge.
pub fn validate_squash(migrations: &[Migration], cutoff_id: u64) -> SquashReport {
    let mut warnings = Vec::new();
    for m in migrations.iter().filter(|m| m.id <= cutoff_id) {
        if m.has_transform() {
            warnings.push(format!(
                "migration {} has a transform; it is dropped unless transforms are \
                 explicitly concatenated, which may not replicate step-by-step semantics",
                m.id
            ));
        }
        if m.has_validate() {
            warnings.push(format!(
                "migration {} has a validate hook; squashing always drops it",
                m.id
            ));
        }
        if m.has_rollback() {
            warnings.push(format!(
                "migration {} has a rollback hook; squashing always drops it",
                m.id
            ));
        }
    }
    SquashReport {
        valid: true,
        warnings,
    }
}

/// Reassign ids `start_id..start_id + n - 1` in ascending original order,
/// preserving every other field. Keeps bookkeeping simple after repeated
/// squashes.
pub fn renumber_migrations(migrations: &[Migration], start_id: u64) -> Vec<Migration> {
    let mut ordered = migrations.to_vec();
    ordered.sort_by_key(|m| m.id);
    for (i, m) in ordered.iter_mut().enumerate() {
        m.id = start_id + i as u64;
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Document, TxnError};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Minimal single-table transaction fake for hook tests.
    #[derive(Default)]
    struct FakeTxn {
        rows: BTreeMap<(String, String), Document>,
    }

    impl StoreTxn for FakeTxn {
        fn get(&self, table: &str, key: &str) -> Result<Option<Document>, TxnError> {
            Ok(self.rows.get(&(table.to_string(), key.to_string())).cloned())
        }
        fn put(&mut self, table: &str, key: &str, doc: Document) -> Result<(), TxnError> {
            self.rows.insert((table.to_string(), key.to_string()), doc);
            Ok(())
        }
        fn delete(&mut self, table: &str, key: &str) -> Result<(), TxnError> {
            self.rows.remove(&(table.to_string(), key.to_string()));
            Ok(())
        }
        fn scan(&self, table: &str) -> Result<Vec<(String, Document)>, TxnError> {
            Ok(self
                .rows
                .iter()
                .filter(|((t, _), _)| t == table)
                .map(|((_, k), v)| (k.clone(), v.clone()))
                .collect())
        }
        fn clear(&mut self, table: &str) -> Result<(), TxnError> {
            self.rows.retain(|(t, _), _| t != table);
            Ok(())
        }
    }

    struct RecordingHooks {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        with_validate: bool,
    }

    impl MigrationHooks for RecordingHooks {
        fn transform(&self, _tx: &mut dyn StoreTxn) -> Result<(), HookError> {
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }
        fn has_transform(&self) -> bool {
            true
        }
        fn has_validate(&self) -> bool {
            self.with_validate
        }
    }

    fn simple_set() -> Vec<Migration> {
        vec![
            Migration::new(1, "init").with_store("a", "id"),
            Migration::new(2, "users").with_store("users", "id,email"),
            Migration::new(5, "reshape").with_store("users", "++id,email,name"),
            Migration::new(9, "tags").with_store("tags", "id,*labels"),
        ]
    }

    #[test]
    fn squash_splits_at_cutoff() {
        // Ids [1, 2, 5, 9], cutoff 5.
        let outcome = squash_migrations(&simple_set(), &SquashOptions::up_to(5)).unwrap();

        assert_eq!(outcome.squashed_ids, vec![1, 2, 5]);
        assert_eq!(outcome.base.id, 1);
        let remaining: Vec<u64> = outcome.remaining.iter().map(|m| m.id).collect();
        assert_eq!(remaining, vec![9]);
    }

    #[test]
    fn base_carries_folded_schema() {
        let outcome = squash_migrations(&simple_set(), &SquashOptions::up_to(5)).unwrap();
        let stores = outcome.base.stores.unwrap();
        assert_eq!(stores["users"], Some("++id,email,name".to_string()));
        assert_eq!(stores["a"], Some("id".to_string()));
        assert!(!stores.contains_key("tags"));
    }

    #[test]
    fn squash_below_all_ids_fails() {
        let err = squash_migrations(&simple_set(), &SquashOptions::up_to(0)).unwrap_err();
        assert_eq!(err, SquashError::NoMigrationsToSquash { cutoff_id: 0 });
    }

    #[test]
    fn base_name_override() {
        let options = SquashOptions {
            cutoff_id: 2,
            base_name: Some("baseline".into()),
            transforms: TransformHandling::Discard,
        };
        let outcome = squash_migrations(&simple_set(), &options).unwrap();
        assert_eq!(outcome.base.name, "baseline");
    }

    #[test]
    fn transforms_dropped_by_default() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = vec![Migration::new(1, "init").with_store("a", "id").with_hooks(Arc::new(
            RecordingHooks {
                label: "t1",
                log: log.clone(),
                with_validate: false,
            },
        ))];

        let outcome = squash_migrations(&set, &SquashOptions::up_to(1)).unwrap();
        assert!(outcome.base.hooks.is_none());
    }

    #[test]
    fn concatenated_transforms_run_in_original_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = |label| {
            Arc::new(RecordingHooks {
                label,
                log: log.clone(),
                with_validate: false,
            })
        };
        let set = vec![
            Migration::new(3, "c").with_hooks(hooks("t3")),
            Migration::new(1, "a").with_hooks(hooks("t1")),
            Migration::new(2, "b").with_hooks(hooks("t2")),
        ];

        let options = SquashOptions {
            cutoff_id: 3,
            base_name: None,
            transforms: TransformHandling::UnsafeConcatenate,
        };
        let outcome = squash_migrations(&set, &options).unwrap();

        let combined = outcome.base.hooks.unwrap();
        assert!(combined.has_transform());
        // Validate is dropped even in the unsafe path.
        assert!(!combined.has_validate());
        assert!(!combined.has_rollback());

        let mut tx = FakeTxn::default();
        combined.transform(&mut tx).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn validate_squash_never_blocks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = vec![
            Migration::new(1, "a").with_hooks(Arc::new(RecordingHooks {
                label: "t1",
                log,
                with_validate: true,
            })),
            Migration::new(2, "b"),
        ];

        let report = validate_squash(&set, 2);
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("transform")));
        assert!(report.warnings.iter().any(|w| w.contains("validate")));
    }

    #[test]
    fn renumber_preserves_order_and_content() {
        // Ids [1, 5] become [1, 2].
        let set = vec![
            Migration::new(1, "a").with_store("a", "id"),
            Migration::new(5, "b").with_store("b", "id"),
        ];
        let renumbered = renumber_migrations(&set, 1);

        let ids: Vec<u64> = renumbered.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(renumbered[0].name, "a");
        assert_eq!(renumbered[1].name, "b");
        assert_eq!(
            renumbered[1].stores.as_ref().unwrap()["b"],
            Some("id".to_string())
        );
    }

    #[test]
    fn renumber_with_custom_start() {
        let set = vec![Migration::new(7, "x"), Migration::new(3, "y")];
        let renumbered = renumber_migrations(&set, 10);
        let ids: Vec<u64> = renumbered.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![10, 11]);
        assert_eq!(renumbered[0].name, "y"); // id 3 sorts first
    }
}
