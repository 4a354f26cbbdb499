//! Migration-set validation and ordering.
//!
//! [`sequence`] is the single source of truth for migration order: every
//! other component (applier, schema fold, squash) works from its output.

use std::collections::BTreeSet;
use std::fmt;

use crate::migration::Migration;

/// A malformed migration set. Raised before any store interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// The input set was empty.
    Empty,
    /// A migration id appeared more than once.
    DuplicateId { id: u64 },
    /// The migration at `index` has a non-positive id.
    InvalidId { index: usize },
    /// The migration with `id` has an empty name.
    EmptyName { id: u64 },
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "at least one migration required"),
            Self::DuplicateId { id } => write!(f, "duplicate migration id {id}"),
            Self::InvalidId { index } => {
                write!(f, "migration at index {index} must have a positive id")
            }
            Self::EmptyName { id } => {
                write!(f, "migration {id} must have a non-empty name")
            }
        }
    }
}

impl std::error::Error for SequenceError {}

/// Validate a migration set and return it ordered by ascending id.
///
/// The position of a migration in the returned sequence (0-based index `i`)
/// determines the store version it maps to: `i + 1`. Gaps between ids do
/// not produce gaps between versions.
pub fn sequence(migrations: &[Migration]) -> Result<Vec<Migration>, SequenceError> {
    if migrations.is_empty() {
        return Err(SequenceError::Empty);
    }

    let mut seen = BTreeSet::new();
    for (index, m) in migrations.iter().enumerate() {
        if m.id == 0 {
            return Err(SequenceError::InvalidId { index });
        }
        if !seen.insert(m.id) {
            return Err(SequenceError::DuplicateId { id: m.id });
        }
        if m.name.trim().is_empty() {
            return Err(SequenceError::EmptyName { id: m.id });
        }
    }

    let mut ordered = migrations.to_vec();
    ordered.sort_by_key(|m| m.id);
    Ok(ordered)
}

/// The 1-based version number for the migration at `position` in a
/// sequenced set.
pub fn version_for_position(position: usize) -> u32 {
    (position as u32) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_rejected() {
        let err = sequence(&[]).unwrap_err();
        assert_eq!(err, SequenceError::Empty);
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let set = vec![Migration::new(2, "a"), Migration::new(2, "b")];
        assert_eq!(sequence(&set).unwrap_err(), SequenceError::DuplicateId { id: 2 });
    }

    #[test]
    fn zero_id_rejected_with_index() {
        let set = vec![Migration::new(1, "a"), Migration::new(0, "b")];
        assert_eq!(sequence(&set).unwrap_err(), SequenceError::InvalidId { index: 1 });
    }

    #[test]
    fn blank_name_rejected_with_id() {
        let set = vec![Migration::new(4, "  ")];
        assert_eq!(sequence(&set).unwrap_err(), SequenceError::EmptyName { id: 4 });
    }

    #[test]
    fn orders_by_id_regardless_of_input_order() {
        let set = vec![
            Migration::new(9, "third"),
            Migration::new(1, "first"),
            Migration::new(5, "second"),
        ];
        let ordered = sequence(&set).unwrap();
        let ids: Vec<u64> = ordered.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 5, 9]);
    }

    #[test]
    fn versions_are_positional_not_id_based() {
        // Ids 1, 5, 9 map to versions 1, 2, 3.
        assert_eq!(version_for_position(0), 1);
        assert_eq!(version_for_position(2), 3);
    }
}
