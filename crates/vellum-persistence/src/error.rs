use vellum_store::StoreError;
use vellum_types::TypeError;

/// Errors from the reconciliation engine.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The key is empty or whitespace only.
    #[error("invalid key {0:?}: keys must not be blank")]
    InvalidKey(String),

    /// A key row exists without any value rows.
    #[error("inconsistent store: key '{key}' has no values")]
    InconsistentStore { key: String },

    /// The aggregate carries no variant set at all.
    #[error("no values given for key '{key}' ({description:?})")]
    NullValues {
        key: String,
        description: Option<String>,
    },

    /// The aggregate's variant set is empty.
    #[error("empty values given for key '{key}' ({description:?})")]
    EmptyValues {
        key: String,
        description: Option<String>,
    },

    /// A variant of the key has no pattern.
    #[error("a value of key '{key}' has no pattern")]
    MissingPattern { key: String },

    /// A variant to remove carries no value.
    #[error("the value to remove from key '{key}' is missing")]
    MissingValue { key: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for engine operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;
