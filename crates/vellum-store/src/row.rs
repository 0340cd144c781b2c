//! Row model of the two relational tables.
//!
//! ```text
//! key_table(id PRIMARY KEY, description NULLABLE)
//! value_table(id PRIMARY KEY GENERATED, key_id NOT NULL REFERENCES key_table,
//!             pattern NOT NULL, value NULLABLE, change_set NULLABLE,
//!             UNIQUE (key_id, pattern, change_set))
//! ```

use serde::{Deserialize, Serialize};

/// Store-generated surrogate id of a value row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u64);

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Encoded content of the value column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodedValue(Vec<u8>);

impl EncodedValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A row of the key table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRow {
    pub id: String,
    pub description: Option<String>,
}

impl KeyRow {
    pub fn new(id: impl Into<String>, description: Option<String>) -> Self {
        Self {
            id: id.into(),
            description,
        }
    }
}

/// A row of the value table.
///
/// `id` is `None` until the row has been committed; the store assigns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRow {
    pub id: Option<ValueId>,
    pub key_id: String,
    pub pattern: String,
    pub value: Option<EncodedValue>,
    pub change_set: Option<String>,
}

impl ValueRow {
    /// A new, not yet persisted row.
    pub fn new(
        key_id: impl Into<String>,
        pattern: impl Into<String>,
        value: Option<EncodedValue>,
        change_set: Option<String>,
    ) -> Self {
        Self {
            id: None,
            key_id: key_id.into(),
            pattern: pattern.into(),
            value,
            change_set,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// Either kind of row, as handed to a unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Row {
    Key(KeyRow),
    Value(ValueRow),
}

impl Row {
    /// Short human-readable identity for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Row::Key(k) => format!("key '{}'", k.id),
            Row::Value(v) => match v.id {
                Some(id) => format!("value {id} of key '{}'", v.key_id),
                None => format!("new value of key '{}' (pattern '{}')", v.key_id, v.pattern),
            },
        }
    }
}

impl From<KeyRow> for Row {
    fn from(row: KeyRow) -> Self {
        Row::Key(row)
    }
}

impl From<ValueRow> for Row {
    fn from(row: ValueRow) -> Self {
        Row::Value(row)
    }
}
