//! SQLite versioned store backend using rusqlite.
//!
//! The primary backend for desktop and edge applications. Rows are JSON
//! documents in a single `keva_rows` table; declared table shapes live in
//! `keva_tables`; the committed version in `keva_meta`. Each version
//! upgrade runs inside one SQLite transaction, so the version number and
//! its data changes commit (or vanish) together — which is what makes
//! upgrade callbacks exactly-once across reopens.
//!
//! Uses WAL mode by default for concurrent read/write performance.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use keva_migrate::{
    Document, OpenError, StoreTxn, TableSchema, TxnError, VersionDecl, VersionedStore,
};

const VERSION_KEY: &str = "version";

/// SQLite configuration options.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// SQLite journal mode. Defaults to WAL.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds. Defaults to 5000.
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-Ahead Logging — allows concurrent reads during writes.
    Wal,
    /// Traditional rollback journal.
    Delete,
    /// In-memory journal (fastest, no crash recovery).
    Memory,
}

impl JournalMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

/// Error type for the SQLite backend.
#[derive(Debug)]
pub enum SqliteError {
    /// An error from rusqlite.
    Sqlite(rusqlite::Error),
    /// Stored metadata that should be valid JSON was not.
    CorruptMeta(String),
    /// Lock poisoned.
    LockPoisoned,
}

impl std::fmt::Display for SqliteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::CorruptMeta(msg) => write!(f, "corrupt store metadata: {msg}"),
            Self::LockPoisoned => write!(f, "sqlite lock poisoned"),
        }
    }
}

impl std::error::Error for SqliteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for SqliteError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

/// SQLite versioned store.
///
/// Wraps a `rusqlite::Connection` behind a `Mutex` for safe shared access.
/// Creates its internal schema automatically on first open.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file with default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteError> {
        Self::open_with_config(path, SqliteConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
    ) -> Result<Self, SqliteError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn, &config)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, SqliteError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn, &SqliteConfig::default())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_connection(conn: &Connection, config: &SqliteConfig) -> Result<(), SqliteError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};
             PRAGMA synchronous = NORMAL;",
            config.journal_mode.as_str(),
            config.busy_timeout_ms,
        ))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS keva_meta (
                k TEXT PRIMARY KEY,
                v TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS keva_tables (
                name   TEXT PRIMARY KEY,
                schema TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS keva_rows (
                table_name TEXT NOT NULL,
                key        TEXT NOT NULL,
                doc        TEXT NOT NULL,
                PRIMARY KEY (table_name, key)
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SqliteError> {
        self.conn.lock().map_err(|_| SqliteError::LockPoisoned)
    }

    fn stored_version(conn: &Connection) -> Result<u32, SqliteError> {
        let v: Option<String> = conn
            .query_row(
                "SELECT v FROM keva_meta WHERE k = ?1",
                params![VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match v {
            Some(v) => v
                .parse()
                .map_err(|_| SqliteError::CorruptMeta(format!("version `{v}`"))),
            None => Ok(0),
        }
    }
}

/// Transaction view handed to upgrade callbacks. Table existence is
/// checked against the declared set, not against `keva_rows`, so reads of
/// empty declared tables succeed and undeclared tables are rejected.
struct SqliteTxn<'a> {
    tx: &'a rusqlite::Transaction<'a>,
    declared: Vec<String>,
}

impl SqliteTxn<'_> {
    fn check_table(&self, table: &str) -> Result<(), TxnError> {
        if self.declared.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(TxnError::MissingTable(table.to_string()))
        }
    }

    fn backend<E: std::fmt::Display>(e: E) -> TxnError {
        TxnError::Backend(e.to_string())
    }
}

impl StoreTxn for SqliteTxn<'_> {
    fn get(&self, table: &str, key: &str) -> Result<Option<Document>, TxnError> {
        self.check_table(table)?;
        let doc: Option<String> = self
            .tx
            .query_row(
                "SELECT doc FROM keva_rows WHERE table_name = ?1 AND key = ?2",
                params![table, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Self::backend)?;
        doc.map(|d| serde_json::from_str(&d).map_err(Self::backend))
            .transpose()
    }

    fn put(&mut self, table: &str, key: &str, doc: Document) -> Result<(), TxnError> {
        self.check_table(table)?;
        let doc = serde_json::to_string(&doc).map_err(Self::backend)?;
        self.tx
            .execute(
                "INSERT INTO keva_rows (table_name, key, doc) VALUES (?1, ?2, ?3)
                 ON CONFLICT(table_name, key) DO UPDATE SET doc = excluded.doc",
                params![table, key, doc],
            )
            .map_err(Self::backend)?;
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &str) -> Result<(), TxnError> {
        self.check_table(table)?;
        self.tx
            .execute(
                "DELETE FROM keva_rows WHERE table_name = ?1 AND key = ?2",
                params![table, key],
            )
            .map_err(Self::backend)?;
        Ok(())
    }

    fn scan(&self, table: &str) -> Result<Vec<(String, Document)>, TxnError> {
        self.check_table(table)?;
        let mut stmt = self
            .tx
            .prepare("SELECT key, doc FROM keva_rows WHERE table_name = ?1 ORDER BY key")
            .map_err(Self::backend)?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(Self::backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Self::backend)?;
        rows.into_iter()
            .map(|(k, d)| Ok((k, serde_json::from_str(&d).map_err(Self::backend)?)))
            .collect()
    }

    fn clear(&mut self, table: &str) -> Result<(), TxnError> {
        self.check_table(table)?;
        self.tx
            .execute(
                "DELETE FROM keva_rows WHERE table_name = ?1",
                params![table],
            )
            .map_err(Self::backend)?;
        Ok(())
    }
}

impl VersionedStore for SqliteStore {
    type Error = SqliteError;

    fn current_version(&self) -> Result<u32, Self::Error> {
        let conn = self.lock()?;
        Self::stored_version(&conn)
    }

    fn open(&mut self, versions: Vec<VersionDecl>) -> Result<(), OpenError<Self::Error>> {
        let conn = self.lock().map_err(OpenError::Backend)?;
        let current = Self::stored_version(&conn).map_err(OpenError::Backend)?;

        for decl in versions {
            if decl.version <= current {
                continue;
            }

            let tx = conn
                .unchecked_transaction()
                .map_err(|e| OpenError::Backend(e.into()))?;

            let result = (|| -> Result<(), OpenError<SqliteError>> {
                let backend = |e: rusqlite::Error| OpenError::Backend(SqliteError::from(e));

                // Reconcile the table set against the declaration: drop
                // what is no longer declared (rows included), then record
                // the declared shapes.
                let declared: Vec<String> = decl.tables.keys().cloned().collect();
                {
                    let mut drop_stmt = tx
                        .prepare("SELECT name FROM keva_tables")
                        .map_err(backend)?;
                    let existing = drop_stmt
                        .query_map([], |row| row.get::<_, String>(0))
                        .map_err(backend)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(backend)?;
                    for name in existing {
                        if !declared.contains(&name) {
                            tx.execute("DELETE FROM keva_tables WHERE name = ?1", params![name])
                                .map_err(backend)?;
                            tx.execute(
                                "DELETE FROM keva_rows WHERE table_name = ?1",
                                params![name],
                            )
                            .map_err(backend)?;
                        }
                    }
                }
                for (name, schema) in &decl.tables {
                    let schema = serde_json::to_string(schema).map_err(|e| {
                        OpenError::Backend(SqliteError::CorruptMeta(e.to_string()))
                    })?;
                    tx.execute(
                        "INSERT INTO keva_tables (name, schema) VALUES (?1, ?2)
                         ON CONFLICT(name) DO UPDATE SET schema = excluded.schema",
                        params![name, schema],
                    )
                    .map_err(backend)?;
                }

                if let Some(upgrade) = decl.upgrade {
                    let mut txn = SqliteTxn { tx: &tx, declared };
                    upgrade(&mut txn).map_err(|source| OpenError::Upgrade {
                        version: decl.version,
                        source,
                    })?;
                }

                tx.execute(
                    "INSERT INTO keva_meta (k, v) VALUES (?1, ?2)
                     ON CONFLICT(k) DO UPDATE SET v = excluded.v",
                    params![VERSION_KEY, decl.version.to_string()],
                )
                .map_err(backend)?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    tx.commit().map_err(|e| OpenError::Backend(e.into()))?;
                }
                Err(e) => {
                    // Dropping the transaction rolls it back; the failing
                    // version leaves no trace.
                    drop(tx);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn table_names(&self) -> Result<Vec<String>, Self::Error> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM keva_tables ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, Self::Error> {
        let conn = self.lock()?;
        let schema: Option<String> = conn
            .query_row(
                "SELECT schema FROM keva_tables WHERE name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        schema
            .map(|s| serde_json::from_str(&s).map_err(|e| SqliteError::CorruptMeta(e.to_string())))
            .transpose()
    }

    fn read_table(&self, table: &str) -> Result<Vec<(String, Document)>, Self::Error> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key, doc FROM keva_rows WHERE table_name = ?1 ORDER BY key")?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(k, d)| {
                let doc =
                    serde_json::from_str(&d).map_err(|e| SqliteError::CorruptMeta(e.to_string()))?;
                Ok((k, doc))
            })
            .collect()
    }
}
