// ABOUTME: Table descriptors, column kinds and row values shared by every engine
// ABOUTME: Describes the fixed set of migratable tables and their foreign-key references

use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage class of a column, used to encode and decode values per engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
}

/// One column of a migratable table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Identity and shape of one migratable table
///
/// `references` lists the principal tables this table points at through foreign keys.
/// Every principal must be migrated before the table itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub references: Vec<String>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            columns: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(ColumnDef::new(name, kind));
        self
    }

    pub fn references(mut self, principal: impl Into<String>) -> Self {
        self.references.push(principal.into());
        self
    }

    /// Kind of the primary-key column, if the key is one of the declared columns
    pub fn primary_key_kind(&self) -> Option<ColumnKind> {
        self.columns
            .iter()
            .find(|c| c.name == self.primary_key)
            .map(|c| c.kind)
    }
}

impl fmt::Display for TableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A single column value read from a source engine
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
}

/// One row, ordered like the table descriptor's columns
pub type Row = Vec<Value>;
