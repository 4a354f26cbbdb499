//! Table index-specification strings.
//!
//! A table's shape is declared as one comma-separated string:
//!
//! ```text
//! "++id,email,&slug,*tags,[first+last]"
//! ```
//!
//! The first entry is the primary key (`++` marks it auto-incrementing).
//! Every following entry declares an index: `&` makes it unique, `*` makes
//! it multi-entry, and `[a+b]` declares a compound index over several
//! fields. Each migration's specification for a table replaces the previous
//! one wholesale — specs are never merged.

use std::fmt;

/// One index entry parsed from a specification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Fields covered by the index. A single element for plain indexes,
    /// several for compound ones.
    pub fields: Vec<String>,
    /// `&` modifier: values must be unique.
    pub unique: bool,
    /// `*` modifier: the field holds an array, each element indexed.
    pub multi_entry: bool,
}

/// A fully parsed table specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSpec {
    /// Primary key field name.
    pub primary_key: String,
    /// Whether the primary key auto-increments (`++` prefix).
    pub auto_increment: bool,
    /// Secondary indexes, in declaration order.
    pub indexes: Vec<IndexSpec>,
}

/// A specification string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecError {
    pub spec: String,
    pub reason: String,
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid table spec `{}`: {}", self.spec, self.reason)
    }
}

impl std::error::Error for SpecError {}

impl ParsedSpec {
    /// All field names the spec mentions, primary key first, compound
    /// entries flattened, duplicates removed, declaration order preserved.
    pub fn field_names(&self) -> Vec<String> {
        let mut out = vec![self.primary_key.clone()];
        for index in &self.indexes {
            for field in &index.fields {
                if !out.contains(field) {
                    out.push(field.clone());
                }
            }
        }
        out
    }
}

/// Parse a full table specification string.
pub fn parse_table_spec(spec: &str) -> Result<ParsedSpec, SpecError> {
    let err = |reason: &str| SpecError {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let mut entries = split_entries(spec).into_iter();

    let first = entries.next().filter(|e| !e.is_empty()).ok_or_else(|| {
        err("missing primary key entry")
    })?;

    let (auto_increment, pk) = match first.strip_prefix("++") {
        Some(rest) => (true, rest.trim().to_string()),
        None => (false, first),
    };
    if pk.is_empty() {
        return Err(err("empty primary key name"));
    }
    if pk.starts_with('[') {
        return Err(err("compound primary keys are not supported"));
    }

    let mut indexes = Vec::new();
    for entry in entries {
        if entry.is_empty() {
            return Err(err("empty index entry"));
        }
        indexes.push(parse_index(&entry).map_err(|reason| err(&reason))?);
    }

    Ok(ParsedSpec {
        primary_key: pk,
        auto_increment,
        indexes,
    })
}

/// Reduce a specification string to its field names.
///
/// Modifier prefixes and compound brackets are stripped; compound entries
/// contribute each component field. Used by drift validation to compare a
/// declared spec against a store's actual `{primary_key} ∪ indexes`.
pub fn spec_field_names(spec: &str) -> Result<Vec<String>, SpecError> {
    Ok(parse_table_spec(spec)?.field_names())
}

fn parse_index(entry: &str) -> Result<IndexSpec, String> {
    let mut rest = entry;
    let mut unique = false;
    let mut multi_entry = false;

    loop {
        if let Some(r) = rest.strip_prefix('&') {
            unique = true;
            rest = r.trim_start();
        } else if let Some(r) = rest.strip_prefix('*') {
            multi_entry = true;
            rest = r.trim_start();
        } else {
            break;
        }
    }

    let fields = if let Some(inner) = rest.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| format!("unterminated compound index `{entry}`"))?;
        let fields: Vec<String> = inner
            .split('+')
            .map(|f| f.trim().to_string())
            .collect();
        if fields.iter().any(|f| f.is_empty()) || fields.len() < 2 {
            return Err(format!("malformed compound index `{entry}`"));
        }
        fields
    } else {
        if rest.is_empty() {
            return Err(format!("empty index entry `{entry}`"));
        }
        vec![rest.to_string()]
    };

    Ok(IndexSpec {
        fields,
        unique,
        multi_entry,
    })
}

fn split_entries(spec: &str) -> Vec<String> {
    // Commas inside [a+b] do not occur (compound uses `+`), so a plain
    // split is sufficient.
    spec.split(',').map(|e| e.trim().to_string()).collect()
}
