//! Field-level canonicalization of analysis documents.
//!
//! Monetary and score fields are either a finite number or the `"unknown"`
//! sentinel once a document has passed through [`normalize`]. Nothing downstream
//! ever sees `null` or `NaN` in those positions.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value as JsonValue};

pub const UNKNOWN_SENTINEL: &str = "unknown";

/// Keys treated as money or scores wherever they appear in a document.
pub const METRIC_FIELDS: &[&str] = &[
    "price",
    "monthlyCost",
    "upfrontCost",
    "priceDifference",
    "averageMonthlyCost",
    "score",
    "valueScore",
];

/// Metric keys a record must carry, by the key of the container holding the record.
const REQUIRED_BY_CONTAINER: &[(&str, &[&str])] = &[
    ("products", &["price", "monthlyCost", "upfrontCost", "valueScore"]),
    ("homeProduct", &["price", "monthlyCost", "upfrontCost"]),
    ("rivalProduct", &["price", "monthlyCost", "upfrontCost"]),
    ("productMatches", &["priceDifference", "score"]),
    ("brandScores", &["score", "averageMonthlyCost"]),
];

/// A monetary amount or score that may be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Metric {
    Known(f64),
    #[default]
    Unknown,
}

impl Metric {
    pub fn value(self) -> Option<f64> {
        match self {
            Metric::Known(v) => Some(v),
            Metric::Unknown => None,
        }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite()).map_or(Metric::Unknown, Metric::Known),
            JsonValue::String(s) => parse_amount(s).map_or(Metric::Unknown, Metric::Known),
            _ => Metric::Unknown,
        }
    }

    pub fn to_json(self) -> JsonValue {
        match self {
            Metric::Known(v) => Number::from_f64(v).map_or_else(|| JsonValue::from(UNKNOWN_SENTINEL), JsonValue::Number),
            Metric::Unknown => JsonValue::from(UNKNOWN_SENTINEL),
        }
    }
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Metric::Known(v) if v.is_finite() => serializer.serialize_f64(*v),
            _ => serializer.serialize_str(UNKNOWN_SENTINEL),
        }
    }
}

impl<'de> Deserialize<'de> for Metric {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = JsonValue::deserialize(deserializer)?;
        Ok(Metric::from_json(&raw))
    }
}

/// Strips currency symbols, thousands separators and whitespace before parsing.
fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '£' | '$' | '€' | ',' | ' '))
        .collect();
    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case(UNKNOWN_SENTINEL) {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn coerce_metric(value: &JsonValue) -> JsonValue {
    Metric::from_json(value).to_json()
}

/// Canonicalizes every known metric field in `document`. Idempotent.
pub fn normalize(mut document: JsonValue) -> JsonValue {
    normalize_in_place(&mut document, None);
    document
}

fn normalize_in_place(value: &mut JsonValue, container: Option<&str>) {
    match value {
        JsonValue::Object(object) => normalize_object(object, container),
        JsonValue::Array(items) => {
            for item in items {
                normalize_in_place(item, container);
            }
        }
        _ => {}
    }
}

fn normalize_object(object: &mut Map<String, JsonValue>, container: Option<&str>) {
    if let Some((_, required)) = container.and_then(|key| REQUIRED_BY_CONTAINER.iter().find(|(c, _)| *c == key)) {
        for field in *required {
            object.entry(field.to_string()).or_insert(JsonValue::Null);
        }
    }
    for (key, child) in object.iter_mut() {
        if METRIC_FIELDS.contains(&key.as_str()) {
            *child = coerce_metric(child);
        } else {
            normalize_in_place(child, Some(key.as_str()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_price_becomes_unknown_and_renormalizing_is_noop() {
        let once = normalize(json!({"price": null}));
        assert_eq!(once, json!({"price": "unknown"}));
        assert_eq!(normalize(once.clone()), once);
    }

    #[test]
    fn numeric_strings_are_parsed_and_garbage_is_unknown() {
        let doc = normalize(json!({
            "products": [
                {"name": "A", "price": "£1,299.00", "monthlyCost": "abc", "valueScore": 8},
                {"name": "B", "price": true}
            ]
        }));
        assert_eq!(doc["products"][0]["price"], json!(1299.0));
        assert_eq!(doc["products"][0]["monthlyCost"], json!("unknown"));
        assert_eq!(doc["products"][0]["upfrontCost"], json!("unknown"));
        assert_eq!(doc["products"][0]["valueScore"], json!(8.0));
        assert_eq!(doc["products"][1]["price"], json!("unknown"));
        assert_eq!(normalize(doc.clone()), doc);
    }

    #[test]
    fn missing_fields_are_filled_only_in_known_records() {
        let doc = normalize(json!({
            "summary": "s",
            "productMatches": [{"homeProduct": {"name": "x"}, "rivalProduct": {"name": "y"}}],
            "metadata": {"generatedBy": "model"}
        }));
        assert_eq!(doc["productMatches"][0]["score"], json!("unknown"));
        assert_eq!(doc["productMatches"][0]["homeProduct"]["monthlyCost"], json!("unknown"));
        assert!(doc["metadata"].get("price").is_none());
        assert_eq!(doc["summary"], json!("s"));
    }

    #[test]
    fn metric_round_trips_through_serde() {
        let parsed: Metric = serde_json::from_value(json!("unknown")).unwrap();
        assert_eq!(parsed, Metric::Unknown);
        let parsed: Metric = serde_json::from_value(json!(4.5)).unwrap();
        assert_eq!(parsed.value(), Some(4.5));
        assert_eq!(serde_json::to_value(Metric::Unknown).unwrap(), json!("unknown"));
    }
}
