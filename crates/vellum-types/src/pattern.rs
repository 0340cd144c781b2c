//! Domain patterns: ordered domain-part tuples serialized as a single string.
//!
//! A pattern is the `|`-joined list of domain parts a value is scoped to.
//! The empty pattern means "no domain restriction".

use crate::error::TypeError;

/// Separator between domain parts inside a serialized pattern.
pub const PATTERN_SEPARATOR: char = '|';

/// Join domain parts into a pattern string.
///
/// Parts must not contain [`PATTERN_SEPARATOR`], otherwise the pattern could
/// not be split back into the same tuple.
///
/// # Examples
///
/// ```
/// use vellum_types::join_pattern;
///
/// assert_eq!(join_pattern(&["de", "mobile"]).unwrap(), "de|mobile");
/// assert_eq!(join_pattern::<&str>(&[]).unwrap(), "");
/// assert!(join_pattern(&["a|b"]).is_err());
/// ```
pub fn join_pattern<S: AsRef<str>>(parts: &[S]) -> Result<String, TypeError> {
    let mut pattern = String::new();
    for (index, part) in parts.iter().enumerate() {
        let part = part.as_ref();
        if part.contains(PATTERN_SEPARATOR) {
            return Err(TypeError::InvalidDomainPart {
                part: part.to_string(),
            });
        }
        if index > 0 {
            pattern.push(PATTERN_SEPARATOR);
        }
        pattern.push_str(part);
    }
    Ok(pattern)
}

/// Split a pattern string into its domain parts.
///
/// The empty pattern yields an empty tuple.
pub fn split_pattern(pattern: &str) -> Vec<&str> {
    if pattern.is_empty() {
        return Vec::new();
    }
    pattern.split(PATTERN_SEPARATOR).collect()
}
