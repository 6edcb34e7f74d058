//! Write conditions: a boolean algebra over the current stream version.
//!
//! A [`WriteCondition`] guards a write against concurrent modification. The
//! common case is "the stream must still be at version N", but arbitrary
//! compositions are allowed, e.g. "at least 3 and below 100, but not 40".
//!
//! Conditions have two surfaces: [`VersionCondition::eval`] decides the
//! predicate against an in-memory version, and storage backends lower the
//! same tree into a native filter expression so the version update can be a
//! conditional statement. Both surfaces must agree.
//!
//! # Examples
//!
//! ```
//! use stratus::{VersionCondition, WriteCondition};
//!
//! let condition = WriteCondition::stream_version_eq(3);
//! assert!(matches!(condition, WriteCondition::StreamVersion(_)));
//!
//! let composite = VersionCondition::and(vec![
//!     VersionCondition::Gte(0),
//!     VersionCondition::Lt(100),
//!     VersionCondition::Ne(40),
//! ]);
//! assert!(composite.eval(3));
//! assert!(!composite.eval(40));
//! assert_eq!(
//!     composite.to_string(),
//!     "to be greater than or equal to 0 and to be less than 100 and to not be equal to 40"
//! );
//! ```

use std::fmt;

/// The concurrency guard applied to a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// No condition: the write is accepted at any stream version.
    AnyStreamVersion,
    /// The write is accepted only if the condition holds for the current
    /// stream version.
    StreamVersion(VersionCondition),
}

impl WriteCondition {
    /// The most common condition: the stream version must equal `version`.
    pub const fn stream_version_eq(version: u64) -> Self {
        Self::StreamVersion(VersionCondition::Eq(version))
    }

    /// Guards the write with an arbitrary version predicate.
    pub const fn stream_version(condition: VersionCondition) -> Self {
        Self::StreamVersion(condition)
    }

    /// Whether this condition accepts every version.
    pub const fn is_any(&self) -> bool {
        matches!(self, Self::AnyStreamVersion)
    }

    /// Evaluates the condition against a stream version.
    ///
    /// `AnyStreamVersion` accepts everything.
    pub fn eval(&self, version: u64) -> bool {
        match self {
            Self::AnyStreamVersion => true,
            Self::StreamVersion(condition) => condition.eval(version),
        }
    }
}

impl fmt::Display for WriteCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnyStreamVersion => write!(f, "any stream version"),
            Self::StreamVersion(condition) => condition.fmt(f),
        }
    }
}

/// A predicate tree over an integer stream version.
///
/// Leaves are binary comparisons against a constant; `And`, `Or` and `Not`
/// compose them with arbitrary nesting. Evaluation is pure and side-effect
/// free, so evaluation order inside connectives is unobservable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCondition {
    /// The version equals the constant.
    Eq(u64),
    /// The version differs from the constant.
    Ne(u64),
    /// The version is strictly less than the constant.
    Lt(u64),
    /// The version is strictly greater than the constant.
    Gt(u64),
    /// The version is at most the constant.
    Lte(u64),
    /// The version is at least the constant.
    Gte(u64),
    /// All child conditions hold.
    And(Vec<VersionCondition>),
    /// At least one child condition holds.
    Or(Vec<VersionCondition>),
    /// The child condition does not hold.
    Not(Box<VersionCondition>),
}

impl VersionCondition {
    /// Conjunction of the given conditions. Empty input is vacuously true.
    pub fn and(conditions: Vec<VersionCondition>) -> Self {
        Self::And(conditions)
    }

    /// Disjunction of the given conditions. Empty input is vacuously false.
    pub fn or(conditions: Vec<VersionCondition>) -> Self {
        Self::Or(conditions)
    }

    /// Negation of the given condition.
    pub fn not(condition: VersionCondition) -> Self {
        Self::Not(Box::new(condition))
    }

    /// Evaluates the predicate against `version`.
    pub fn eval(&self, version: u64) -> bool {
        match self {
            Self::Eq(expected) => version == *expected,
            Self::Ne(expected) => version != *expected,
            Self::Lt(bound) => version < *bound,
            Self::Gt(bound) => version > *bound,
            Self::Lte(bound) => version <= *bound,
            Self::Gte(bound) => version >= *bound,
            Self::And(children) => children.iter().all(|child| child.eval(version)),
            Self::Or(children) => children.iter().any(|child| child.eval(version)),
            Self::Not(child) => !child.eval(version),
        }
    }
}

// The phrasing feeds directly into the WriteConditionNotFulfilled message,
// which callers match on, so it is part of the public contract.
impl fmt::Display for VersionCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(
            f: &mut fmt::Formatter<'_>,
            children: &[VersionCondition],
            separator: &str,
        ) -> fmt::Result {
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, " {separator} ")?;
                }
                child.fmt(f)?;
            }
            Ok(())
        }

        match self {
            Self::Eq(v) => write!(f, "to be equal to {v}"),
            Self::Ne(v) => write!(f, "to not be equal to {v}"),
            Self::Lt(v) => write!(f, "to be less than {v}"),
            Self::Gt(v) => write!(f, "to be greater than {v}"),
            Self::Lte(v) => write!(f, "to be less than or equal to {v}"),
            Self::Gte(v) => write!(f, "to be greater than or equal to {v}"),
            Self::And(children) => join(f, children, "and"),
            Self::Or(children) => join(f, children, "or"),
            Self::Not(child) => write!(f, "not {child}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn leaf_conditions_evaluate_arithmetically() {
        assert!(VersionCondition::Eq(3).eval(3));
        assert!(!VersionCondition::Eq(3).eval(4));
        assert!(VersionCondition::Ne(3).eval(4));
        assert!(VersionCondition::Lt(3).eval(2));
        assert!(!VersionCondition::Lt(3).eval(3));
        assert!(VersionCondition::Gt(3).eval(4));
        assert!(VersionCondition::Lte(3).eval(3));
        assert!(VersionCondition::Gte(3).eval(3));
    }

    #[test]
    fn composite_conditions_follow_boolean_semantics() {
        let composite = VersionCondition::and(vec![
            VersionCondition::Gte(0),
            VersionCondition::Lt(100),
            VersionCondition::Ne(40),
        ]);
        assert!(composite.eval(1));
        assert!(!composite.eval(40));
        assert!(!composite.eval(100));

        let either = VersionCondition::or(vec![VersionCondition::Gte(100), VersionCondition::Lt(1)]);
        assert!(either.eval(0));
        assert!(either.eval(100));
        assert!(!either.eval(1));

        assert!(VersionCondition::not(VersionCondition::Eq(1)).eval(2));
        assert!(!VersionCondition::not(VersionCondition::Eq(1)).eval(1));
    }

    #[test]
    fn empty_connectives_are_vacuous() {
        assert!(VersionCondition::and(vec![]).eval(0));
        assert!(!VersionCondition::or(vec![]).eval(0));
    }

    #[test]
    fn any_stream_version_accepts_everything() {
        assert!(WriteCondition::AnyStreamVersion.eval(0));
        assert!(WriteCondition::AnyStreamVersion.eval(u64::MAX));
        assert!(WriteCondition::AnyStreamVersion.is_any());
        assert!(!WriteCondition::stream_version_eq(0).is_any());
    }

    #[test]
    fn leaves_render_the_canonical_phrases() {
        assert_eq!(VersionCondition::Eq(10).to_string(), "to be equal to 10");
        assert_eq!(VersionCondition::Ne(1).to_string(), "to not be equal to 1");
        assert_eq!(VersionCondition::Lt(0).to_string(), "to be less than 0");
        assert_eq!(VersionCondition::Gt(100).to_string(), "to be greater than 100");
        assert_eq!(
            VersionCondition::Lte(0).to_string(),
            "to be less than or equal to 0"
        );
        assert_eq!(
            VersionCondition::Gte(100).to_string(),
            "to be greater than or equal to 100"
        );
    }

    #[test]
    fn connectives_render_with_and_or_not() {
        let composite = VersionCondition::and(vec![
            VersionCondition::Gte(0),
            VersionCondition::Lt(100),
            VersionCondition::Ne(1),
        ]);
        assert_eq!(
            composite.to_string(),
            "to be greater than or equal to 0 and to be less than 100 and to not be equal to 1"
        );

        let either = VersionCondition::or(vec![VersionCondition::Gte(100), VersionCondition::Lt(1)]);
        assert_eq!(
            either.to_string(),
            "to be greater than or equal to 100 or to be less than 1"
        );

        assert_eq!(
            VersionCondition::not(VersionCondition::Eq(1)).to_string(),
            "not to be equal to 1"
        );
    }

    fn arb_condition() -> impl Strategy<Value = VersionCondition> {
        let leaf = prop_oneof![
            (0u64..200).prop_map(VersionCondition::Eq),
            (0u64..200).prop_map(VersionCondition::Ne),
            (0u64..200).prop_map(VersionCondition::Lt),
            (0u64..200).prop_map(VersionCondition::Gt),
            (0u64..200).prop_map(VersionCondition::Lte),
            (0u64..200).prop_map(VersionCondition::Gte),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..4).prop_map(VersionCondition::And),
                prop::collection::vec(inner.clone(), 1..4).prop_map(VersionCondition::Or),
                inner.prop_map(VersionCondition::not),
            ]
        })
    }

    proptest! {
        #[test]
        fn not_inverts_evaluation(condition in arb_condition(), version in 0u64..300) {
            let negated = VersionCondition::not(condition.clone());
            prop_assert_eq!(negated.eval(version), !condition.eval(version));
        }

        #[test]
        fn and_is_conjunction(
            children in prop::collection::vec(arb_condition(), 0..4),
            version in 0u64..300
        ) {
            let expected = children.iter().all(|c| c.eval(version));
            prop_assert_eq!(VersionCondition::and(children).eval(version), expected);
        }

        #[test]
        fn or_is_disjunction(
            children in prop::collection::vec(arb_condition(), 0..4),
            version in 0u64..300
        ) {
            let expected = children.iter().any(|c| c.eval(version));
            prop_assert_eq!(VersionCondition::or(children).eval(version), expected);
        }
    }
}
