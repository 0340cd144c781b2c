//! Change-set normalization.
//!
//! A change set is an optional named overlay of values. The aggregate and
//! the storage layer both model it as `Option<&str>`, but two conventions
//! meet here:
//!
//! - An empty label means the same as no label ([`null_when_empty`]).
//! - Identity lookups compare against a non-null sentinel, because a
//!   relational NULL never compares equal to NULL ([`change_set_sentinel`]).
//!
//! The sentinel is only ever used for comparisons. Stored rows keep the true
//! optional form.

/// Sentinel standing in for "no change set" in identity comparisons.
pub const NO_CHANGE_SET: &str = "";

/// Treat an empty change-set label as no change set.
pub fn null_when_empty(change_set: Option<&str>) -> Option<&str> {
    change_set.filter(|cs| !cs.is_empty())
}

/// Map a change set to its comparison sentinel (`None` → `""`).
pub fn change_set_sentinel(change_set: Option<&str>) -> &str {
    change_set.unwrap_or(NO_CHANGE_SET)
}
