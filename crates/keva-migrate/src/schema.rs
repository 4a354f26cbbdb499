//! Schema snapshots, the expected-schema fold, and drift detection.
//!
//! Two views of the world are compared here: the *expected* schema, a pure
//! fold over a migration set, and the *actual* schema, introspected from a
//! live store. [`validate_schema`] reports the difference as errors (the
//! store is missing something the migrations promise) and warnings (the
//! store carries something the migrations do not know about).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::migration::{now_ms, Migration, INTERNAL_TABLE_PREFIX};
use crate::spec::{parse_table_spec, spec_field_names};
use crate::store::VersionedStore;

/// Actual shape of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Primary key field.
    pub primary_key: String,
    /// Indexed field names, in declaration order.
    pub indexes: Vec<String>,
    /// Whether the primary key auto-increments.
    pub auto_increment: bool,
}

impl TableSchema {
    /// Derive the shape a specification string declares.
    pub fn from_spec(name: &str, spec: &str) -> Result<Self, crate::spec::SpecError> {
        let parsed = parse_table_spec(spec)?;
        let mut indexes = Vec::new();
        for index in &parsed.indexes {
            for field in &index.fields {
                if field != &parsed.primary_key && !indexes.contains(field) {
                    indexes.push(field.clone());
                }
            }
        }
        Ok(Self {
            name: name.to_string(),
            primary_key: parsed.primary_key,
            indexes,
            auto_increment: parsed.auto_increment,
        })
    }

    fn field_set(&self) -> BTreeSet<&str> {
        let mut fields: BTreeSet<&str> = self.indexes.iter().map(String::as_str).collect();
        fields.insert(self.primary_key.as_str());
        fields
    }
}

/// Point-in-time capture of a store's actual schema. Caller-owned; serde
/// round-trips it through any document store for drift tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Store version at capture time.
    pub version: u32,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Every live table, internal ones included.
    pub tables: BTreeMap<String, TableSchema>,
    /// Highest migration id in the set supplied at capture time (0 if empty).
    pub last_migration_id: u64,
}

/// Outcome of a drift check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// True when no errors were found. Warnings do not affect validity.
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// Tables present only in the newer snapshot.
    pub added: Vec<String>,
    /// Tables present only in the older snapshot.
    pub removed: Vec<String>,
    /// Tables present in both whose shape changed.
    pub modified: Vec<String>,
}

impl SnapshotDiff {
    /// True when the snapshots describe identical table sets and shapes.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Fold a migration set into its theoretical end-state schema.
///
/// Pure function of the *set*: the input is re-sorted by id internally, so
/// any permutation of the same migrations yields the same result. For each
/// table the last non-`None` specification wins wholesale; a `None` entry
/// removes the table from that point forward.
pub fn expected_schema(migrations: &[Migration]) -> BTreeMap<String, String> {
    let mut ordered: Vec<&Migration> = migrations.iter().collect();
    ordered.sort_by_key(|m| m.id);

    let mut folded: BTreeMap<String, String> = BTreeMap::new();
    for m in ordered {
        let Some(stores) = &m.stores else { continue };
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
    folded
}

/// Capture the actual schema of a live store. Performs no mutation.
pub fn snapshot<S: VersionedStore>(
    store: &S,
    migrations: &[Migration],
) -> Result<SchemaSnapshot, S::Error> {
    let version = store.current_version()?;
    let mut tables = BTreeMap::new();
    for name in store.table_names()? {
        if let Some(schema) = store.table_schema(&name)? {
            tables.insert(name, schema);
        }
    }
    Ok(SchemaSnapshot {
        version,
        timestamp: now_ms(),
        tables,
        last_migration_id: migrations.iter().map(|m| m.id).max().unwrap_or(0),
    })
}

/// Compare an actual snapshot against an expected schema fold.
///
/// - expected table absent from the store → error
/// - store table (non-internal) absent from expected → warning
/// - expected field absent from `{primary_key} ∪ indexes` → error
/// - actual field the spec does not mention → warning
///
/// An unparseable expected spec is itself reported as an error.
pub fn validate_schema(
    actual: &SchemaSnapshot,
    expected: &BTreeMap<String, String>,
) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for (table, spec) in expected {
        let Some(actual_table) = actual.tables.get(table) else {
            errors.push(format!("missing table `{table}`"));
            continue;
        };

        let expected_fields = match spec_field_names(spec) {
            Ok(fields) => fields,
            Err(e) => {
                errors.push(e.to_string());
                continue;
            }
        };

        let actual_fields = actual_table.field_set();
        for field in &expected_fields {
            if !actual_fields.contains(field.as_str()) {
                errors.push(format!("table `{table}` is missing field `{field}`"));
            }
        }
        for field in actual_fields {
            if !expected_fields.iter().any(|f| f == field) {
                warnings.push(format!("table `{table}` has unexpected field `{field}`"));
            }
        }
    }

    for table in actual.tables.keys() {
        if table.starts_with(INTERNAL_TABLE_PREFIX) {
            continue;
        }
        if !expected.contains_key(table) {
            warnings.push(format!("unexpected table `{table}`"));
        }
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Structural difference between two snapshots of the same store.
pub fn compare_snapshots(old: &SchemaSnapshot, new: &SchemaSnapshot) -> SnapshotDiff {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut modified = Vec::new();

    for (name, new_table) in &new.tables {
        match old.tables.get(name) {
            None => added.push(name.clone()),
            Some(old_table) if old_table != new_table => modified.push(name.clone()),
            Some(_) => {}
        }
    }
    for name in old.tables.keys() {
        if !new.tables.contains_key(name) {
            removed.push(name.clone());
        }
    }

    SnapshotDiff {
        added,
        removed,
        modified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(name: &str, pk: &str, indexes: &[&str]) -> TableSchema {
        TableSchema {
            name: name.to_string(),
            primary_key: pk.to_string(),
            indexes: indexes.iter().map(|s| s.to_string()).collect(),
            auto_increment: false,
        }
    }

    fn snap(tables: Vec<TableSchema>) -> SchemaSnapshot {
        SchemaSnapshot {
            version: 1,
            timestamp: 0,
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            last_migration_id: 1,
        }
    }

    #[test]
    fn fold_last_spec_wins_wholesale() {
        let set = vec![
            Migration::new(1, "init").with_store("users", "id,email"),
            Migration::new(2, "reshape").with_store("users", "++id,name"),
        ];
        let folded = expected_schema(&set);
        // The v2 spec replaces v1 entirely — `email` is gone.
        assert_eq!(folded["users"], "++id,name");
        assert_eq!(folded.len(), 1);
    }

    #[test]
    fn fold_none_removes_table_from_that_point() {
        let set = vec![
            Migration::new(1, "init").with_store("legacy", "id"),
            Migration::new(2, "drop").without_store("legacy"),
            Migration::new(3, "other").with_store("users", "id"),
        ];
        let folded = expected_schema(&set);
        assert!(!folded.contains_key("legacy"));
        assert!(folded.contains_key("users"));
    }

    #[test]
    fn fold_is_order_independent() {
        let a = Migration::new(1, "a").with_store("t", "id");
        let b = Migration::new(2, "b").with_store("t", "id,x");
        let c = Migration::new(3, "c").without_store("t");

        let forward = expected_schema(&[a.clone(), b.clone(), c.clone()]);
        let shuffled = expected_schema(&[c, a, b]);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn fold_of_empty_set_is_empty() {
        assert!(expected_schema(&[]).is_empty());
    }

    #[test]
    fn table_schema_from_spec() {
        let t = TableSchema::from_spec("users", "++id,email,[first+last]").unwrap();
        assert_eq!(t.primary_key, "id");
        assert!(t.auto_increment);
        assert_eq!(t.indexes, vec!["email", "first", "last"]);
    }

    #[test]
    fn validate_reports_missing_table_as_error() {
        let actual = snap(vec![]);
        let expected = BTreeMap::from([("users".to_string(), "id,email".to_string())]);

        let result = validate_schema(&actual, &expected);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("missing table `users`")));
    }

    #[test]
    fn validate_reports_unexpected_table_as_warning() {
        let actual = snap(vec![table("stray", "id", &[])]);
        let result = validate_schema(&actual, &BTreeMap::new());
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("unexpected table `stray`")));
    }

    #[test]
    fn validate_skips_internal_tables() {
        let actual = snap(vec![table("_keva_migrations", "id", &[])]);
        let result = validate_schema(&actual, &BTreeMap::new());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn validate_field_differences() {
        let actual = snap(vec![table("users", "id", &["name"])]);
        let expected = BTreeMap::from([("users".to_string(), "id,email".to_string())]);

        let result = validate_schema(&actual, &expected);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("missing field `email`")));
        assert!(result.warnings.iter().any(|w| w.contains("unexpected field `name`")));
    }

    #[test]
    fn validate_clean_store_passes() {
        let actual = snap(vec![table("users", "id", &["email"])]);
        let expected = BTreeMap::from([("users".to_string(), "id,email".to_string())]);

        let result = validate_schema(&actual, &expected);
        assert!(result.valid, "errors: {:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn compare_snapshots_diffs_tables() {
        let old = snap(vec![table("a", "id", &[]), table("b", "id", &[])]);
        let new = snap(vec![table("b", "id", &["x"]), table("c", "id", &[])]);

        let diff = compare_snapshots(&old, &new);
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.removed, vec!["a"]);
        assert_eq!(diff.modified, vec!["b"]);
        assert!(!diff.is_empty());
    }

    #[test]
    fn compare_identical_snapshots_is_empty() {
        let s = snap(vec![table("a", "id", &[])]);
        assert!(compare_snapshots(&s, &s).is_empty());
    }

    proptest! {
        // Permuting a migration set never changes the fold.
        #[test]
        fn fold_invariant_under_permutation(seed in 0u64..1000) {
            let mut set = vec![
                Migration::new(1, "a").with_store("t", "id"),
                Migration::new(2, "b").with_store("t", "id,x").with_store("u", "id"),
                Migration::new(3, "c").without_store("u"),
                Migration::new(4, "d").with_store("v", "++id,&slug"),
            ];
            let baseline = expected_schema(&set);

            // Cheap deterministic shuffle.
            let n = set.len();
            for i in 0..n {
                let j = ((seed as usize) + i * 7) % n;
                set.swap(i, j);
            }
            prop_assert_eq!(expected_schema(&set), baseline);
        }
    }
}
