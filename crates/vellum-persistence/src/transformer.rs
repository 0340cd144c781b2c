//! Conversion between stored value rows and key aggregates.

use vellum_store::{EncodedValue, ValueCodec, ValueRow};
use vellum_types::{split_pattern, DomainValue, KeyValues, KeyValuesFactory};

use crate::error::{PersistenceError, PersistenceResult};

/// Build an aggregate from the value rows of one key.
///
/// Returns `None` for an empty row list, never an empty aggregate.
pub fn to_key_values<F: KeyValuesFactory>(
    rows: &[ValueRow],
    description: Option<&str>,
    factory: &F,
    codec: &ValueCodec,
) -> PersistenceResult<Option<F::KeyValues>> {
    if rows.is_empty() {
        return Ok(None);
    }

    let mut key_values = factory.create();
    key_values.set_description(description.map(str::to_string));
    for row in rows {
        let value = codec.decode(row.value.as_ref())?;
        let parts = split_pattern(&row.pattern);
        match row.change_set.as_deref() {
            None => key_values.put(value, &parts)?,
            Some(change_set) => key_values.put_with_change_set(change_set, value, &parts)?,
        }
    }
    Ok(Some(key_values))
}

/// A variant validated for writing: its pattern and encoded value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedValue {
    pub pattern: String,
    pub value: Option<EncodedValue>,
}

/// Validate and encode one variant of `key` for the value table.
pub fn prepare_value(
    key: &str,
    variant: &DomainValue,
    codec: &ValueCodec,
) -> PersistenceResult<PreparedValue> {
    let pattern = variant
        .pattern_str()
        .ok_or_else(|| PersistenceError::MissingPattern {
            key: key.to_string(),
        })?;
    Ok(PreparedValue {
        pattern: pattern.to_string(),
        value: codec.encode(variant.value())?,
    })
}
