//! Text encoding of day-keyed counters.
//!
//! Scalar counters encode as `{"YYYY-MM-DD": n}` and nested counters as
//! `{"YYYY-MM-DD": {"subkey": n}}`. Decoding is lenient: a missing or
//! unparseable payload is an empty mapping, and individual entries with a bad
//! day key or a non-integer count are skipped.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::clock::DayKey;

/// Day → count.
pub type ScalarCounter = BTreeMap<DayKey, u64>;

/// Day → (subkey → count).
pub type NestedCounter = BTreeMap<DayKey, BTreeMap<String, u64>>;

/// What a lenient decode had to throw away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Whole payload was not a JSON object.
    pub malformed: bool,
    /// Entries skipped inside an otherwise valid payload.
    pub skipped_entries: usize,
}

impl DecodeReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.malformed && self.skipped_entries == 0
    }
}

fn parse_object(raw: Option<&str>, report: &mut DecodeReport) -> serde_json::Map<String, Value> {
    let Some(raw) = raw else {
        return serde_json::Map::new();
    };
    if raw.trim().is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            report.malformed = true;
            serde_json::Map::new()
        }
    }
}

pub fn decode_scalar(raw: Option<&str>) -> (ScalarCounter, DecodeReport) {
    let mut report = DecodeReport::default();
    let mut out = ScalarCounter::new();
    for (day, count) in parse_object(raw, &mut report) {
        match (DayKey::parse(&day), count.as_u64()) {
            (Some(day), Some(count)) => {
                out.insert(day, count);
            }
            _ => report.skipped_entries += 1,
        }
    }
    (out, report)
}

pub fn decode_nested(raw: Option<&str>) -> (NestedCounter, DecodeReport) {
    let mut report = DecodeReport::default();
    let mut out = NestedCounter::new();
    for (day, inner) in parse_object(raw, &mut report) {
        let (Some(day), Value::Object(inner)) = (DayKey::parse(&day), inner) else {
            report.skipped_entries += 1;
            continue;
        };
        let mut counts = BTreeMap::new();
        for (subkey, count) in inner {
            match count.as_u64() {
                Some(count) if !subkey.is_empty() => {
                    counts.insert(subkey, count);
                }
                _ => report.skipped_entries += 1,
            }
        }
        if !counts.is_empty() {
            out.insert(day, counts);
        }
    }
    (out, report)
}

#[must_use]
pub fn encode_scalar(counter: &ScalarCounter) -> String {
    // BTreeMap<DayKey, u64> always serializes; DayKey is a string newtype.
    serde_json::to_string(counter).unwrap_or_else(|_| "{}".to_string())
}

#[must_use]
pub fn encode_nested(counter: &NestedCounter) -> String {
    serde_json::to_string(counter).unwrap_or_else(|_| "{}".to_string())
}

/// Total number of non-zero cells, for logs and diagnostics.
#[must_use]
pub fn nested_cells(counter: &NestedCounter) -> usize {
    counter.values().map(BTreeMap::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(raw: &str) -> DayKey {
        DayKey::parse(raw).unwrap()
    }

    #[test]
    fn missing_and_blank_payloads_are_empty_and_clean() {
        let (counter, report) = decode_scalar(None);
        assert!(counter.is_empty());
        assert!(report.is_clean());
        let (nested, report) = decode_nested(Some("   "));
        assert!(nested.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn malformed_payload_decodes_to_empty() {
        for raw in ["{oops", "[1,2,3]", "42", "\"2024-01-01\""] {
            let (counter, report) = decode_nested(Some(raw));
            assert!(counter.is_empty(), "payload {raw:?} should decode empty");
            assert!(report.malformed, "payload {raw:?} should be flagged");
        }
    }

    #[test]
    fn bad_entries_are_skipped_individually() {
        let raw = r#"{"2024-01-01": 3, "not-a-day": 9, "2024-01-02": -1, "2024-01-03": 1.5, "2024-01-04": 2}"#;
        let (counter, report) = decode_scalar(Some(raw));
        assert_eq!(counter.len(), 2);
        assert_eq!(counter[&day("2024-01-01")], 3);
        assert_eq!(counter[&day("2024-01-04")], 2);
        assert_eq!(report.skipped_entries, 3);
        assert!(!report.malformed);
    }

    #[test]
    fn nested_skips_bad_cells_and_empty_days() {
        let raw = r#"{
            "2024-01-01": {"qr": 3, "": 4, "calc": "x"},
            "2024-01-02": 5,
            "2024-01-03": {"bad": -2}
        }"#;
        let (counter, report) = decode_nested(Some(raw));
        assert_eq!(counter.len(), 1);
        assert_eq!(counter[&day("2024-01-01")]["qr"], 3);
        assert_eq!(report.skipped_entries, 4);
    }

    #[test]
    fn encoding_is_readable_by_decoder() {
        let mut nested = NestedCounter::new();
        nested
            .entry(day("2024-01-01"))
            .or_default()
            .insert("qr".to_string(), 3);
        let encoded = encode_nested(&nested);
        assert_eq!(encoded, r#"{"2024-01-01":{"qr":3}}"#);
        let (decoded, report) = decode_nested(Some(&encoded));
        assert_eq!(decoded, nested);
        assert!(report.is_clean());
        assert_eq!(nested_cells(&decoded), 1);
    }
}
