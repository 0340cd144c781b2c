//! Store-agnostic query model.
//!
//! Queries are a table, a list of AND-combined criteria over named columns,
//! and a projection (rows or a count). Backends translate them into their
//! native query facility; a backend that cannot express a query returns no
//! result set at all, which the accessors report as a wiring defect.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// The two relational tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    Keys,
    Values,
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keys => write!(f, "key"),
            Self::Values => write!(f, "value"),
        }
    }
}

/// A column of one of the tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    /// `key_table.id`
    KeyId,
    /// `key_table.description`
    Description,
    /// `value_table.key_id`
    ValueKey,
    /// `value_table.pattern`
    Pattern,
    /// `value_table.value`
    Value,
    /// `value_table.change_set`
    ChangeSet,
}

impl Field {
    pub fn table(&self) -> Table {
        match self {
            Self::KeyId | Self::Description => Table::Keys,
            Self::ValueKey | Self::Pattern | Self::Value | Self::ChangeSet => Table::Values,
        }
    }

    /// Whether the column holds text (and so supports `LIKE`).
    pub fn is_text(&self) -> bool {
        !matches!(self, Self::Value)
    }

    pub fn column_name(&self) -> &'static str {
        match self {
            Self::KeyId => "id",
            Self::Description => "description",
            Self::ValueKey => "key_id",
            Self::Pattern => "pattern",
            Self::Value => "value",
            Self::ChangeSet => "change_set",
        }
    }
}

/// A single restriction on a column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criterion {
    /// `field = value`. NULL never matches.
    Equals { field: Field, value: String },
    /// `COALESCE(field, default) = value`.
    EqualsCoalesced {
        field: Field,
        default: String,
        value: String,
    },
    /// `LOWER(field) LIKE LOWER(expression)`, with `%` and `_` wildcards.
    Like { field: Field, expression: String },
}

impl Criterion {
    pub fn equals(field: Field, value: impl Into<String>) -> Self {
        Self::Equals {
            field,
            value: value.into(),
        }
    }

    pub fn equals_coalesced(field: Field, default: impl Into<String>, value: impl Into<String>) -> Self {
        Self::EqualsCoalesced {
            field,
            default: default.into(),
            value: value.into(),
        }
    }

    pub fn like(field: Field, expression: impl Into<String>) -> Self {
        Self::Like {
            field,
            expression: expression.into(),
        }
    }

    /// Case-insensitive substring match. Wildcards in `fragment` match
    /// literally.
    pub fn contains(field: Field, fragment: &str) -> Self {
        Self::like(field, format!("%{}%", escape_like(fragment)))
    }

    pub fn field(&self) -> Field {
        match self {
            Self::Equals { field, .. }
            | Self::EqualsCoalesced { field, .. }
            | Self::Like { field, .. } => *field,
        }
    }

    /// Evaluate against a nullable column value.
    pub fn matches(&self, column: Option<&str>) -> bool {
        match self {
            Self::Equals { value, .. } => column == Some(value.as_str()),
            Self::EqualsCoalesced { default, value, .. } => {
                column.unwrap_or(default.as_str()) == value.as_str()
            }
            Self::Like { expression, .. } => column.is_some_and(|c| like_matches(expression, c)),
        }
    }
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equals { field, value } => write!(f, "{} = '{value}'", field.column_name()),
            Self::EqualsCoalesced {
                field,
                default,
                value,
            } => write!(
                f,
                "COALESCE({}, '{default}') = '{value}'",
                field.column_name()
            ),
            Self::Like { field, expression } => {
                write!(f, "LOWER({}) LIKE '{expression}'", field.column_name())
            }
        }
    }
}

/// What a query returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    Rows,
    Count,
}

/// A query against one table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub table: Table,
    pub criteria: Vec<Criterion>,
    pub projection: Projection,
}

impl Query {
    /// Every row of a table.
    pub fn all(table: Table) -> Self {
        Self {
            table,
            criteria: Vec::new(),
            projection: Projection::Rows,
        }
    }

    /// Rows matching all equality criteria. At least one criterion is required.
    pub fn equality(table: Table, criteria: Vec<Criterion>) -> StoreResult<Self> {
        if criteria.is_empty() {
            return Err(StoreError::InvalidQuery(
                "at least one equals criterion should be given".into(),
            ));
        }
        if let Some(c) = criteria.iter().find(|c| matches!(c, Criterion::Like { .. })) {
            return Err(StoreError::InvalidQuery(format!(
                "equality query given a like criterion: {c}"
            )));
        }
        Ok(Self {
            table,
            criteria,
            projection: Projection::Rows,
        })
    }

    /// Rows matching all like criteria. At least one criterion is required.
    pub fn likeness(table: Table, criteria: Vec<Criterion>) -> StoreResult<Self> {
        if criteria.is_empty() {
            return Err(StoreError::InvalidQuery(
                "at least one like criterion should be given".into(),
            ));
        }
        if let Some(c) = criteria.iter().find(|c| !matches!(c, Criterion::Like { .. })) {
            return Err(StoreError::InvalidQuery(format!(
                "likeness query given a non-like criterion: {c}"
            )));
        }
        Ok(Self {
            table,
            criteria,
            projection: Projection::Rows,
        })
    }

    /// Count of rows matching all criteria.
    pub fn count(table: Table, criteria: Vec<Criterion>) -> Self {
        Self {
            table,
            criteria,
            projection: Projection::Count,
        }
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.projection {
            Projection::Rows => write!(f, "SELECT * FROM {}_table", self.table)?,
            Projection::Count => write!(f, "SELECT COUNT(*) FROM {}_table", self.table)?,
        }
        for (i, c) in self.criteria.iter().enumerate() {
            let joiner = if i == 0 { "WHERE" } else { "AND" };
            write!(f, " {joiner} {c}")?;
        }
        Ok(())
    }
}

/// Escape character of `LIKE` expressions.
pub const LIKE_ESCAPE: char = '\\';

/// Escape `%`, `_` and [`LIKE_ESCAPE`] so `fragment` matches literally.
pub fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | LIKE_ESCAPE) {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Clone, Copy, PartialEq)]
enum LikeToken {
    Literal(char),
    AnyOne,
    AnyRun,
}

fn like_tokens(expression: &str) -> Vec<LikeToken> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => LikeToken::AnyRun,
            '_' => LikeToken::AnyOne,
            // A trailing escape matches itself.
            LIKE_ESCAPE => LikeToken::Literal(chars.next().unwrap_or(LIKE_ESCAPE)),
            other => LikeToken::Literal(other),
        });
    }
    tokens
}

/// SQL `LIKE` matching, case-insensitive. `%` matches any run of characters,
/// `_` exactly one, and [`LIKE_ESCAPE`] makes the next character literal.
pub fn like_matches(expression: &str, candidate: &str) -> bool {
    let pattern = like_tokens(&expression.to_lowercase());
    let text: Vec<char> = candidate.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    // Position of the last `%` and the text index it was tried against.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        let step = match pattern.get(p) {
            Some(LikeToken::AnyOne) => true,
            Some(LikeToken::Literal(c)) => *c == text[t],
            _ => false,
        };
        if step {
            p += 1;
            t += 1;
        } else if pattern.get(p) == Some(&LikeToken::AnyRun) {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&token| token == LikeToken::AnyRun)
}
