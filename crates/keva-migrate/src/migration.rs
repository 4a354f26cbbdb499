//! The migration model: declarative schema deltas plus optional data hooks.
//!
//! A [`Migration`] describes one step of schema evolution. Its `stores` map
//! assigns each table a full index specification string (see [`crate::spec`]),
//! or `None` to delete the table from that step forward. Optional per-step
//! behavior (a data transform and a validation check) is supplied through the
//! [`MigrationHooks`] capability trait rather than ad hoc function fields.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::store::StoreTxn;

/// Name of the internal table that records applied migration ids.
///
/// It is declared in every version alongside user tables and is excluded
/// from drift warnings by [`INTERNAL_TABLE_PREFIX`].
pub const TRACKING_TABLE: &str = "_keva_migrations";

/// Tables whose name starts with this prefix belong to keva itself.
pub const INTERNAL_TABLE_PREFIX: &str = "_keva_";

/// Error returned by [`MigrationHooks`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookError(pub String);

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HookError {}

impl From<String> for HookError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for HookError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// Optional per-migration behavior, run inside the upgrade transaction of
/// the version the migration maps to.
///
/// All operations are optional: the defaults do nothing. A migration that
/// only changes schema needs no hooks at all. Implementors that do provide
/// an operation must also override the matching `has_*` probe — the squash
/// engine relies on the probes to warn about behavior it would discard.
///
/// `rollback` is declared so that external tooling can carry a down-step
/// alongside the migration; the applier itself never invokes it.
pub trait MigrationHooks: Send + Sync {
    /// Transform existing data for the new schema.
    fn transform(&self, _tx: &mut dyn StoreTxn) -> Result<(), HookError> {
        Ok(())
    }

    /// Check the migrated data. Returning `false` (or an error) aborts the
    /// version without committing it.
    fn validate(&self, _tx: &mut dyn StoreTxn) -> Result<bool, HookError> {
        Ok(true)
    }

    /// Down-step for external tooling. Never run by the applier.
    fn rollback(&self, _tx: &mut dyn StoreTxn) -> Result<(), HookError> {
        Ok(())
    }

    /// Whether this value carries a real `transform`.
    fn has_transform(&self) -> bool {
        false
    }

    /// Whether this value carries a real `validate`.
    fn has_validate(&self) -> bool {
        false
    }

    /// Whether this value carries a real `rollback`.
    fn has_rollback(&self) -> bool {
        false
    }
}

/// A single declarative migration.
///
/// `id` must be positive and unique within a set; application order is by
/// ascending `id` regardless of declaration order. The *version number* a
/// migration maps to is its position in the sorted set (1-based) and is
/// decoupled from the id itself — gaps in ids do not create version gaps.
///
/// # Example
///
/// ```
/// use keva_migrate::Migration;
///
/// let m = Migration::new(1, "init")
///     .with_store("users", "++id,email")
///     .with_store("tags", "id,*labels");
/// assert_eq!(m.id, 1);
/// ```
#[derive(Clone)]
pub struct Migration {
    /// Unique positive id; defines application order.
    pub id: u64,
    /// Human-readable name, non-empty.
    pub name: String,
    /// Per-table full index specification, or `None` to delete the table.
    /// A migration without a `stores` map changes no schema.
    pub stores: Option<BTreeMap<String, Option<String>>>,
    /// Optional transform/validate behavior.
    pub hooks: Option<Arc<dyn MigrationHooks>>,
    /// Declared step timeout in milliseconds. Advisory metadata only —
    /// the applier does not enforce it.
    pub timeout_ms: Option<u64>,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stores", &self.stores)
            .field("hooks", &self.hooks.as_ref().map(|_| "<hooks>"))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl Migration {
    /// Create a migration with the given id and name and no schema delta.
    pub fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            stores: None,
            hooks: None,
            timeout_ms: None,
        }
    }

    /// Declare (or redeclare) a table with a full index specification.
    pub fn with_store(mut self, table: &str, spec: &str) -> Self {
        self.stores
            .get_or_insert_with(BTreeMap::new)
            .insert(table.to_string(), Some(spec.to_string()));
        self
    }

    /// Delete a table from this step forward.
    pub fn without_store(mut self, table: &str) -> Self {
        self.stores
            .get_or_insert_with(BTreeMap::new)
            .insert(table.to_string(), None);
        self
    }

    /// Attach transform/validate hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn MigrationHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Record an advisory step timeout. Not enforced by the applier.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Whether this migration carries a transform hook.
    pub fn has_transform(&self) -> bool {
        self.hooks.as_ref().map(|h| h.has_transform()).unwrap_or(false)
    }

    /// Whether this migration carries a validate hook.
    pub fn has_validate(&self) -> bool {
        self.hooks.as_ref().map(|h| h.has_validate()).unwrap_or(false)
    }

    /// Whether this migration carries a rollback hook.
    pub fn has_rollback(&self) -> bool {
        self.hooks.as_ref().map(|h| h.has_rollback()).unwrap_or(false)
    }
}

/// Row stored in the tracking table, one per applied migration.
///
/// Written exactly once, inside the same transaction as the triggering
/// migration's version, and never mutated or deleted afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    /// Id of the applied migration.
    pub id: u64,
    /// Name at the time of application.
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub applied_at: u64,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_stores() {
        let m = Migration::new(3, "add-tags")
            .with_store("tags", "id,*labels")
            .without_store("legacy");

        let stores = m.stores.unwrap();
        assert_eq!(stores["tags"], Some("id,*labels".to_string()));
        assert_eq!(stores["legacy"], None);
    }

    #[test]
    fn hooks_default_to_absent() {
        let m = Migration::new(1, "init");
        assert!(!m.has_transform());
        assert!(!m.has_validate());
        assert!(!m.has_rollback());
    }

    #[test]
    fn applied_record_roundtrips_as_json() {
        let rec = AppliedRecord {
            id: 7,
            name: "add-index".into(),
            applied_at: 1234,
        };
        let doc = serde_json::to_value(&rec).unwrap();
        let back: AppliedRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(back, rec);
    }
}
