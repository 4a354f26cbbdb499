//! Schema drift detection against a persisted snapshot.
//!
//! A snapshot of the store's end-state schema can be written to disk
//! (typically committed to the repository) and later compared against
//! what the migration set now declares. Drift shows up as a
//! [`SnapshotDiff`]; live stores can also be validated directly with
//! [`check_drift`].

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use keva_migrate::{
    compare_snapshots, expected_schema, snapshot, validate_schema, Migration, SchemaSnapshot,
    SnapshotDiff, ValidationResult, VersionedStore,
};

/// Error reading or writing a snapshot file.
#[derive(Debug)]
pub enum DriftError {
    Io(io::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for DriftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "snapshot file error: {e}"),
            Self::Serde(e) => write!(f, "snapshot parse error: {e}"),
        }
    }
}

impl std::error::Error for DriftError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serde(e) => Some(e),
        }
    }
}

impl From<io::Error> for DriftError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for DriftError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}

/// Write a snapshot as pretty-printed JSON.
pub fn write_snapshot<P: AsRef<Path>>(path: P, snap: &SchemaSnapshot) -> Result<(), DriftError> {
    let json = serde_json::to_string_pretty(snap)?;
    fs::write(path, json)?;
    Ok(())
}

/// Read a snapshot previously written by [`write_snapshot`].
pub fn read_snapshot<P: AsRef<Path>>(path: P) -> Result<SchemaSnapshot, DriftError> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Diff a stored snapshot file against a freshly taken one.
pub fn diff_against_file<P: AsRef<Path>, S: VersionedStore>(
    path: P,
    store: &S,
    migrations: &[Migration],
) -> Result<SnapshotDiff, CheckError<S::Error>> {
    let baseline = read_snapshot(path)?;
    let current = snapshot(store, migrations).map_err(CheckError::Store)?;
    Ok(compare_snapshots(&baseline, &current))
}

/// Validate a live store's schema against what the migration set declares.
pub fn check_drift<S: VersionedStore>(
    store: &S,
    migrations: &[Migration],
) -> Result<ValidationResult, CheckError<S::Error>> {
    let snap = snapshot(store, migrations).map_err(CheckError::Store)?;
    Ok(validate_schema(&snap, &expected_schema(migrations)))
}

/// Error from a drift check against a live store.
#[derive(Debug)]
pub enum CheckError<E> {
    Snapshot(DriftError),
    Store(E),
}

impl<E: fmt::Display> fmt::Display for CheckError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CheckError<E> {}

impl<E> From<DriftError> for CheckError<E> {
    fn from(e: DriftError) -> Self {
        Self::Snapshot(e)
    }
}
