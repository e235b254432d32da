//! Store-wide schema and security metadata
//!
//! Metadata follows the same versioning discipline as the topology: each
//! change bumps the sequence number and is retained in a change log so that
//! copies can be brought up to date incrementally.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::Persisted;
use crate::topology::EMPTY_SEQUENCE_NUMBER;

/// Kind of metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetadataKind {
    /// Table schemas
    Table,
    /// Users and roles
    Security,
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataKind::Table => write!(f, "table"),
            MetadataKind::Security => write!(f, "security"),
        }
    }
}

/// A table column
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldDef {
    /// Column name
    pub name: String,
    /// Column type name
    pub field_type: String,
    /// Whether the column accepts nulls
    #[serde(default)]
    pub nullable: bool,
}

/// A table schema
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableDef {
    /// Table name
    pub name: String,
    /// Columns in declaration order
    pub fields: Vec<FieldDef>,
    /// Primary key column names
    pub primary_key: Vec<String>,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
}

impl TableDef {
    /// Whether the table has a column with this name
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

/// A store user
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserDef {
    /// User name
    pub name: String,
    /// Whether the user is an administrator
    pub admin: bool,
    /// Opaque password verifier
    pub password_hash: String,
}

/// A metadata entry
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum MetadataEntry {
    /// A table
    Table(TableDef),
    /// A user
    User(UserDef),
}

/// A single metadata change
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum MetadataOp {
    /// Create or replace an entry
    Put(String, MetadataEntry),
    /// Remove an entry
    Remove(String),
}

/// A metadata change-log entry
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetadataChange {
    /// Sequence number after applying this change
    pub sequence_number: u64,
    /// The change
    pub op: MetadataOp,
}

/// Result of asking for the changes since some sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeInfo {
    /// Changes that bring the copy up to date (possibly none)
    Delta(Vec<MetadataChange>),
    /// The log cannot produce a delta; a full copy must be sent
    Insufficient,
}

/// Versioned store metadata of one kind
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Metadata {
    kind: MetadataKind,
    sequence_number: u64,
    entries: BTreeMap<String, MetadataEntry>,
    #[serde(default)]
    baseline: u64,
    #[serde(default)]
    changes: Vec<MetadataChange>,
}

impl Metadata {
    /// Create empty metadata
    pub fn new(kind: MetadataKind) -> Self {
        Self {
            kind,
            sequence_number: EMPTY_SEQUENCE_NUMBER,
            entries: BTreeMap::new(),
            baseline: EMPTY_SEQUENCE_NUMBER,
            changes: Vec::new(),
        }
    }

    /// Metadata kind
    pub fn kind(&self) -> MetadataKind {
        self.kind
    }

    /// Current sequence number
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Get an entry
    pub fn get(&self, name: &str) -> Option<&MetadataEntry> {
        self.entries.get(name)
    }

    /// Get a table
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        match self.entries.get(name) {
            Some(MetadataEntry::Table(t)) => Some(t),
            _ => None,
        }
    }

    /// Get a user
    pub fn user(&self, name: &str) -> Option<&UserDef> {
        match self.entries.get(name) {
            Some(MetadataEntry::User(u)) => Some(u),
            _ => None,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create or replace an entry
    pub fn put(&mut self, name: impl Into<String>, entry: MetadataEntry) {
        self.record(MetadataOp::Put(name.into(), entry));
    }

    /// Remove an entry, returning whether it existed
    pub fn remove(&mut self, name: &str) -> bool {
        if !self.entries.contains_key(name) {
            return false;
        }
        self.record(MetadataOp::Remove(name.to_string()));
        true
    }

    fn record(&mut self, op: MetadataOp) {
        self.apply_op(&op);
        self.sequence_number += 1;
        self.changes.push(MetadataChange {
            sequence_number: self.sequence_number,
            op,
        });
    }

    fn apply_op(&mut self, op: &MetadataOp) {
        match op {
            MetadataOp::Put(name, entry) => {
                self.entries.insert(name.clone(), entry.clone());
            }
            MetadataOp::Remove(name) => {
                self.entries.remove(name);
            }
        }
    }

    /// Changes needed by a copy at `from_seq`
    pub fn change_info(&self, from_seq: u64) -> ChangeInfo {
        if from_seq == EMPTY_SEQUENCE_NUMBER || from_seq < self.baseline {
            return ChangeInfo::Insufficient;
        }
        ChangeInfo::Delta(
            self.changes
                .iter()
                .filter(|c| c.sequence_number > from_seq)
                .cloned()
                .collect(),
        )
    }

    /// Apply changes produced by [`Metadata::change_info`]
    ///
    /// Returns false, leaving the metadata untouched, when the changes do not
    /// continue from the current sequence number.
    pub fn apply_changes(&mut self, changes: &[MetadataChange]) -> bool {
        let pending: Vec<_> = changes
            .iter()
            .filter(|c| c.sequence_number > self.sequence_number)
            .collect();
        let contiguous = pending
            .iter()
            .enumerate()
            .all(|(i, c)| c.sequence_number == self.sequence_number + 1 + i as u64);
        if !contiguous {
            return false;
        }
        for change in pending {
            self.apply_op(&change.op);
            self.sequence_number = change.sequence_number;
            self.changes.push(change.clone());
        }
        true
    }

    /// Drop change-log entries at or below `up_to`
    pub fn truncate_change_log(&mut self, up_to: u64) {
        let up_to = up_to.min(self.sequence_number);
        if up_to <= self.baseline {
            return;
        }
        self.changes.retain(|c| c.sequence_number > up_to);
        self.baseline = up_to;
    }
}

impl Persisted for Metadata {
    const SCHEMA: &'static str = "metadata";
    const VERSION: u16 = 1;
}
