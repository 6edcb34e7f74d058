//! Server-side filters for change subscriptions.
//!
//! A [`Filter`] restricts which inserted events a subscription sees. The
//! structured form composes comparisons over CloudEvent attributes with
//! `and`/`or`; backends lower it into their native filter expression. A raw
//! vendor-native string is also accepted for anything the DSL cannot say.
//!
//! # Examples
//!
//! ```
//! use stratus::{Comparison, Filter};
//!
//! let filter = Filter::event_type(Comparison::Eq, "NameDefined")
//!     .and(Filter::subject(Comparison::Ne, "ignored"));
//! ```

use chrono::{DateTime, Utc};

/// A binary comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Strictly less than.
    Lt,
    /// Strictly greater than.
    Gt,
    /// Less than or equal.
    Lte,
    /// Greater than or equal.
    Gte,
}

/// A value an attribute is compared against.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// A string value.
    String(String),
    /// An integer value.
    Integer(i64),
    /// A boolean value.
    Boolean(bool),
    /// A UTC instant, for `time` comparisons.
    Time(DateTime<Utc>),
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Time(value)
    }
}

/// A filter over inserted events.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every child filter must match.
    All(Vec<Filter>),
    /// At least one child filter must match.
    Any(Vec<Filter>),
    /// A single attribute comparison.
    Attribute {
        /// The CloudEvent attribute name, e.g. `type` or `subject`.
        name: String,
        /// The comparison operator.
        op: Comparison,
        /// The value compared against.
        value: FilterValue,
    },
    /// A vendor-native filter expression, passed through to the backend
    /// unparsed.
    Raw(String),
}

impl Filter {
    /// Filters on an arbitrary attribute by name.
    pub fn attribute(name: impl Into<String>, op: Comparison, value: impl Into<FilterValue>) -> Self {
        Self::Attribute {
            name: name.into(),
            op,
            value: value.into(),
        }
    }

    /// Filters on the `id` attribute.
    pub fn id(op: Comparison, value: impl Into<String>) -> Self {
        Self::attribute("id", op, value.into())
    }

    /// Filters on the `type` attribute.
    pub fn event_type(op: Comparison, value: impl Into<String>) -> Self {
        Self::attribute("type", op, value.into())
    }

    /// Filters on the `source` attribute.
    pub fn source(op: Comparison, value: impl Into<String>) -> Self {
        Self::attribute("source", op, value.into())
    }

    /// Filters on the `subject` attribute.
    pub fn subject(op: Comparison, value: impl Into<String>) -> Self {
        Self::attribute("subject", op, value.into())
    }

    /// Filters on the `time` attribute.
    pub fn time(op: Comparison, value: DateTime<Utc>) -> Self {
        Self::attribute("time", op, value)
    }

    /// Filters on the stream an event was appended to.
    pub fn stream_id(op: Comparison, value: impl Into<String>) -> Self {
        Self::attribute(crate::event::STREAM_ID_EXTENSION, op, value.into())
    }

    /// A vendor-native filter expression.
    pub fn raw(expression: impl Into<String>) -> Self {
        Self::Raw(expression.into())
    }

    /// Combines two filters so both must match.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::All(mut children) => {
                children.push(other);
                Self::All(children)
            }
            first => Self::All(vec![first, other]),
        }
    }

    /// Combines two filters so either may match.
    #[must_use]
    pub fn or(self, other: Filter) -> Self {
        match self {
            Self::Any(mut children) => {
                children.push(other);
                Self::Any(children)
            }
            first => Self::Any(vec![first, other]),
        }
    }
}
