use crate::query::Table;
use crate::row::ValueId;

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The value's type is not in the store's supported value-type set.
    #[error("cannot serialize value {value}: {reason}")]
    NotSerializable { value: String, reason: String },

    /// A lookup by identity matched more rows than the identity model allows.
    #[error("expected at most one {table} row for {identity}, found {found}")]
    MultipleResults {
        table: Table,
        identity: String,
        found: usize,
    },

    /// A count query produced no row at all.
    #[error("count query for key '{key}' produced no result")]
    MissingCount { key: String },

    /// The backend could not build a query of this shape.
    #[error("backend produced no typed query for {0}")]
    NoTypedQuery(String),

    /// A query was built without the criteria it requires.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A mutating call was made outside an active transaction scope.
    #[error("no transaction started yet; call begin first")]
    NoActiveTransaction,

    /// `begin` was called on a scope that is already active.
    #[error("transaction scope is already active")]
    TransactionAlreadyActive,

    /// A row was removed without being attached to the unit of work.
    #[error("{0} is not attached to the active unit of work")]
    DetachedRow(String),

    /// A row to update or delete no longer exists.
    #[error("stale {table} row: {identity}")]
    StaleRow { table: Table, identity: String },

    /// Insert of a row whose primary key already exists.
    #[error("duplicate primary key {id} in {table} table")]
    PrimaryKeyViolation { table: Table, id: String },

    /// A value row references a missing key, or a key was removed while
    /// values still reference it.
    #[error("foreign key violation for key '{key}': {reason}")]
    ForeignKeyViolation { key: String, reason: String },

    /// Two value rows share `(key_id, pattern, change_set)`.
    #[error("unique constraint violated for key '{key}', pattern '{pattern}', change set {change_set:?} (rows {first} and {second})")]
    UniqueViolation {
        key: String,
        pattern: String,
        change_set: Option<String>,
        first: ValueId,
        second: ValueId,
    },

    /// A journal entry failed validation on recovery.
    #[error("corrupt journal entry {entry}: {reason}")]
    CorruptJournal { entry: usize, reason: String },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A lock guarding backend state was poisoned.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// I/O error from the journal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
