//! Value codec: decides which payloads the store can persist and converts
//! them to and from the value column.
//!
//! The value column holds the JSON encoding of the payload. A missing payload
//! (or JSON `null`) is always accepted and stored as relational NULL.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use vellum_types::{is_nil, Value, ValueKind};

use crate::error::{StoreError, StoreResult};
use crate::row::EncodedValue;

/// The store's supported value-type set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Payload kinds the store accepts.
    pub accepted_kinds: BTreeSet<ValueKind>,
    /// Maximum size of an encoded payload in bytes.
    pub max_encoded_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            accepted_kinds: ValueKind::ALL.into_iter().collect(),
            max_encoded_bytes: 64 * 1024,
        }
    }
}

impl CodecConfig {
    /// Accept scalars only (bool, number, string).
    pub fn scalars_only() -> Self {
        Self {
            accepted_kinds: [ValueKind::Bool, ValueKind::Number, ValueKind::String]
                .into_iter()
                .collect(),
            ..Self::default()
        }
    }
}

/// Validates and encodes payloads for the value column.
#[derive(Clone, Debug, Default)]
pub struct ValueCodec {
    config: CodecConfig,
}

impl ValueCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Fail with [`StoreError::NotSerializable`] unless the payload can be stored.
    pub fn assert_storable(&self, value: Option<&Value>) -> StoreResult<()> {
        self.encode(value).map(|_| ())
    }

    /// Encode a payload into the value column. Nil payloads encode to NULL.
    pub fn encode(&self, value: Option<&Value>) -> StoreResult<Option<EncodedValue>> {
        let value = match value {
            Some(value) if !is_nil(Some(value)) => value,
            _ => return Ok(None),
        };

        // `of` only returns None for null, handled above.
        if let Some(kind) = ValueKind::of(value) {
            if !self.config.accepted_kinds.contains(&kind) {
                return Err(not_serializable(value, format!("{kind} values are not supported")));
            }
        }

        let bytes = serde_json::to_vec(value).map_err(|e| not_serializable(value, e.to_string()))?;
        if bytes.len() > self.config.max_encoded_bytes {
            return Err(not_serializable(
                value,
                format!(
                    "encoded size {} exceeds limit of {} bytes",
                    bytes.len(),
                    self.config.max_encoded_bytes
                ),
            ));
        }
        Ok(Some(EncodedValue::new(bytes)))
    }

    /// Decode the value column back into a payload. NULL decodes to `None`.
    pub fn decode(&self, encoded: Option<&EncodedValue>) -> StoreResult<Option<Value>> {
        encoded
            .map(|e| {
                serde_json::from_slice(e.as_bytes())
                    .map_err(|err| StoreError::Serialization(format!("value column: {err}")))
            })
            .transpose()
    }
}

fn not_serializable(value: &Value, reason: String) -> StoreError {
    let mut shown = value.to_string();
    if shown.len() > 64 {
        let mut end = 64;
        while !shown.is_char_boundary(end) {
            end -= 1;
        }
        shown.truncate(end);
        shown.push_str("...");
    }
    StoreError::NotSerializable {
        value: shown,
        reason,
    }
}
