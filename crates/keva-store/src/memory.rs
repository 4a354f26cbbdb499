//! In-memory versioned store.
//!
//! All state lives in `BTreeMap`s — nothing touches disk. Ideal for tests
//! and prototyping. Versioned state survives reopen within the process:
//! calling [`VersionedStore::open`] again only runs upgrade callbacks for
//! versions above the last committed one.

use std::collections::BTreeMap;
use std::fmt;

use keva_migrate::{
    Document, OpenError, StoreTxn, TableSchema, TxnError, VersionDecl, VersionedStore,
};

/// Error type for the in-memory backend.
///
/// This backend never actually fails, but the trait requires an error type.
#[derive(Debug, Clone)]
pub struct MemoryError(String);

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryStore error: {}", self.0)
    }
}

impl std::error::Error for MemoryError {}

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    rows: BTreeMap<String, Document>,
}

/// In-memory versioned store backend.
///
/// # Example
///
/// ```
/// use keva_migrate::{run, ApplyOptions, Migration, VersionedStore};
/// use keva_store::MemoryStore;
///
/// let mut store = MemoryStore::new();
/// let set = vec![Migration::new(1, "init").with_store("notes", "++id,title")];
/// run(&mut store, &set, ApplyOptions::default()).unwrap();
/// assert_eq!(store.current_version().unwrap(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    version: u32,
    tables: BTreeMap<String, MemTable>,
}

impl MemoryStore {
    /// Create an empty store at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }
}

/// Transaction view over a scratch copy of the table set. The copy is
/// committed only when the upgrade callback succeeds, which gives each
/// version all-or-nothing semantics.
struct MemTxn<'a> {
    tables: &'a mut BTreeMap<String, MemTable>,
}

impl MemTxn<'_> {
    fn table(&self, name: &str) -> Result<&MemTable, TxnError> {
        self.tables
            .get(name)
            .ok_or_else(|| TxnError::MissingTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable, TxnError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| TxnError::MissingTable(name.to_string()))
    }
}

impl StoreTxn for MemTxn<'_> {
    fn get(&self, table: &str, key: &str) -> Result<Option<Document>, TxnError> {
        Ok(self.table(table)?.rows.get(key).cloned())
    }

    fn put(&mut self, table: &str, key: &str, doc: Document) -> Result<(), TxnError> {
        self.table_mut(table)?.rows.insert(key.to_string(), doc);
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &str) -> Result<(), TxnError> {
        self.table_mut(table)?.rows.remove(key);
        Ok(())
    }

    fn scan(&self, table: &str) -> Result<Vec<(String, Document)>, TxnError> {
        Ok(self
            .table(table)?
            .rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&mut self, table: &str) -> Result<(), TxnError> {
        self.table_mut(table)?.rows.clear();
        Ok(())
    }
}

impl VersionedStore for MemoryStore {
    type Error = MemoryError;

    fn current_version(&self) -> Result<u32, Self::Error> {
        Ok(self.version)
    }

    fn open(&mut self, versions: Vec<VersionDecl>) -> Result<(), OpenError<Self::Error>> {
        for decl in versions {
            // Versions at or below the committed one ran historically.
            if decl.version <= self.version {
                continue;
            }

            // Work on a scratch copy; commit only if the upgrade succeeds.
            let mut next = self.tables.clone();

            next.retain(|name, _| decl.tables.contains_key(name));
            for (name, schema) in decl.tables {
                match next.get_mut(&name) {
                    Some(table) => table.schema = schema,
                    None => {
                        next.insert(
                            name,
                            MemTable {
                                schema,
                                rows: BTreeMap::new(),
                            },
                        );
                    }
                }
            }

            if let Some(upgrade) = decl.upgrade {
                let mut txn = MemTxn { tables: &mut next };
                if let Err(source) = upgrade(&mut txn) {
                    return Err(OpenError::Upgrade {
                        version: decl.version,
                        source,
                    });
                }
            }

            self.tables = next;
            self.version = decl.version;
        }
        Ok(())
    }

    fn table_names(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, Self::Error> {
        Ok(self.tables.get(table).map(|t| t.schema.clone()))
    }

    fn read_table(&self, table: &str) -> Result<Vec<(String, Document)>, Self::Error> {
        Ok(self
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}
