//! Lowering of write conditions and subscription filters into MongoDB
//! filter documents.
//!
//! A write condition is lowered onto the version field of the stream
//! version document, so the conditional version update inside a write
//! transaction re-states the condition the store already evaluated in
//! memory. Subscription filters are lowered into a `$match` stage over the
//! change stream's `fullDocument`.

use bson::{doc, Bson, Document};

use stratus::{
    Comparison, EventStoreError, EventStoreResult, Filter, FilterValue, VersionCondition,
};

use crate::document::TimeRepresentation;

/// Lowers a version condition into a filter over `field`.
pub(crate) fn version_condition_to_document(
    field: &str,
    condition: &VersionCondition,
) -> EventStoreResult<Document> {
    let document = match condition {
        VersionCondition::Eq(v) => doc! { field: { "$eq": to_i64(*v)? } },
        VersionCondition::Ne(v) => doc! { field: { "$ne": to_i64(*v)? } },
        VersionCondition::Lt(v) => doc! { field: { "$lt": to_i64(*v)? } },
        VersionCondition::Gt(v) => doc! { field: { "$gt": to_i64(*v)? } },
        VersionCondition::Lte(v) => doc! { field: { "$lte": to_i64(*v)? } },
        VersionCondition::Gte(v) => doc! { field: { "$gte": to_i64(*v)? } },
        VersionCondition::And(children) => doc! { "$and": lower_all(field, children)? },
        VersionCondition::Or(children) => doc! { "$or": lower_all(field, children)? },
        // $not only accepts operator expressions; $nor negates a full
        // sub-query, which is what an arbitrary child needs.
        VersionCondition::Not(child) => {
            doc! { "$nor": [version_condition_to_document(field, child)?] }
        }
    };
    Ok(document)
}

fn lower_all(field: &str, children: &[VersionCondition]) -> EventStoreResult<Vec<Document>> {
    children
        .iter()
        .map(|child| version_condition_to_document(field, child))
        .collect()
}

fn to_i64(version: u64) -> EventStoreResult<i64> {
    i64::try_from(version)
        .map_err(|_| EventStoreError::Internal("stream version exceeds the i64 range".to_string()))
}

/// Lowers a subscription filter into a `$match` document over a change
/// stream notification.
pub(crate) fn filter_to_match_document(
    filter: &Filter,
    time_representation: TimeRepresentation,
) -> EventStoreResult<Document> {
    match filter {
        Filter::All(children) => Ok(doc! {
            "$and": children
                .iter()
                .map(|child| filter_to_match_document(child, time_representation))
                .collect::<EventStoreResult<Vec<_>>>()?
        }),
        Filter::Any(children) => Ok(doc! {
            "$or": children
                .iter()
                .map(|child| filter_to_match_document(child, time_representation))
                .collect::<EventStoreResult<Vec<_>>>()?
        }),
        Filter::Attribute { name, op, value } => {
            let field = format!("fullDocument.{name}");
            let operator = comparison_operator(*op);
            let value = filter_value_to_bson(value, time_representation);
            Ok(doc! { field: { operator: value } })
        }
        // The raw form is MongoDB extended JSON, handed through unchanged.
        Filter::Raw(expression) => {
            let json: serde_json::Value = serde_json::from_str(expression).map_err(|e| {
                EventStoreError::MalformedDocument(format!("invalid raw filter: {e}"))
            })?;
            bson::to_document(&json).map_err(|e| {
                EventStoreError::MalformedDocument(format!("invalid raw filter: {e}"))
            })
        }
    }
}

fn comparison_operator(op: Comparison) -> &'static str {
    match op {
        Comparison::Eq => "$eq",
        Comparison::Ne => "$ne",
        Comparison::Lt => "$lt",
        Comparison::Gt => "$gt",
        Comparison::Lte => "$lte",
        Comparison::Gte => "$gte",
    }
}

fn filter_value_to_bson(value: &FilterValue, time_representation: TimeRepresentation) -> Bson {
    match value {
        FilterValue::String(s) => Bson::String(s.clone()),
        FilterValue::Integer(i) => Bson::Int64(*i),
        FilterValue::Boolean(b) => Bson::Boolean(*b),
        // Match whichever shape the store writes for the time attribute.
        FilterValue::Time(t) => match time_representation {
            TimeRepresentation::Date => Bson::DateTime(bson::DateTime::from_chrono(*t)),
            TimeRepresentation::Rfc3339String => {
                Bson::String(t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn leaf_conditions_lower_to_comparison_operators() {
        let document =
            version_condition_to_document("version", &VersionCondition::Eq(3)).unwrap();
        assert_eq!(document, doc! { "version": { "$eq": 3_i64 } });

        let document =
            version_condition_to_document("version", &VersionCondition::Gte(10)).unwrap();
        assert_eq!(document, doc! { "version": { "$gte": 10_i64 } });
    }

    #[test]
    fn composite_conditions_lower_to_and_or_nor() {
        let condition = VersionCondition::and(vec![
            VersionCondition::Gte(0),
            VersionCondition::not(VersionCondition::Eq(40)),
        ]);
        let document = version_condition_to_document("version", &condition).unwrap();
        assert_eq!(
            document,
            doc! { "$and": [
                { "version": { "$gte": 0_i64 } },
                { "$nor": [ { "version": { "$eq": 40_i64 } } ] },
            ] }
        );
    }

    #[test]
    fn attribute_filters_target_the_full_document() {
        let filter = Filter::event_type(Comparison::Eq, "NameDefined");
        let document =
            filter_to_match_document(&filter, TimeRepresentation::Rfc3339String).unwrap();
        assert_eq!(document, doc! { "fullDocument.type": { "$eq": "NameDefined" } });
    }

    #[test]
    fn composed_filters_nest_under_and() {
        let filter = Filter::event_type(Comparison::Eq, "NameDefined")
            .and(Filter::subject(Comparison::Ne, "ignored"));
        let document =
            filter_to_match_document(&filter, TimeRepresentation::Rfc3339String).unwrap();
        assert_eq!(
            document,
            doc! { "$and": [
                { "fullDocument.type": { "$eq": "NameDefined" } },
                { "fullDocument.subject": { "$ne": "ignored" } },
            ] }
        );
    }

    #[test]
    fn time_filters_follow_the_time_representation() {
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let filter = Filter::time(Comparison::Gte, instant);

        let as_date = filter_to_match_document(&filter, TimeRepresentation::Date).unwrap();
        assert_eq!(
            as_date,
            doc! { "fullDocument.time": { "$gte": bson::DateTime::from_chrono(instant) } }
        );

        let as_string =
            filter_to_match_document(&filter, TimeRepresentation::Rfc3339String).unwrap();
        assert_eq!(
            as_string,
            doc! { "fullDocument.time": { "$gte": "2024-05-01T12:00:00Z" } }
        );
    }

    #[test]
    fn raw_filters_parse_as_extended_json() {
        let filter = Filter::raw(r#"{ "fullDocument.subject": "name" }"#);
        let document =
            filter_to_match_document(&filter, TimeRepresentation::Rfc3339String).unwrap();
        assert_eq!(document, doc! { "fullDocument.subject": "name" });

        let invalid = Filter::raw("not json");
        assert!(filter_to_match_document(&invalid, TimeRepresentation::Rfc3339String).is_err());
    }
}
