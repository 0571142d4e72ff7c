//! Subscription filter evaluation.
//!
//! Pure predicate over an event and a subscription's filter configuration.
//! No I/O, no side effects; validation of predicate well-formedness happens
//! at subscription-creation time (`FilterConfig::validate`), never here.

use serde_json::Value;

use crate::models::{Event, FilterConfig};

/// Evaluates a subscription filter against an event.
///
/// Three checks are ANDed: the event type must be in the filter's event-type
/// set (`*` matches everything, empty set means `["*"]`), the body predicate
/// must structurally match the event payload, and the header predicate must
/// structurally match the event headers.
pub fn matches(event: &Event, filter: &FilterConfig) -> bool {
    if !matches_event_type(&event.event_type, filter) {
        return false;
    }

    if !is_empty_predicate(&filter.body) {
        let Ok(payload) = serde_json::from_slice::<Value>(&event.payload) else {
            // A structured body predicate can never match a non-JSON payload.
            return false;
        };
        if !matches_structure(&filter.body, &payload) {
            return false;
        }
    }

    if !is_empty_predicate(&filter.headers) {
        let headers = serde_json::to_value(event.headers()).unwrap_or(Value::Null);
        if !matches_structure(&filter.headers, &headers) {
            return false;
        }
    }

    true
}

/// Event-type membership check. `*` in the set matches every type.
fn matches_event_type(event_type: &str, filter: &FilterConfig) -> bool {
    filter.event_types().iter().any(|t| *t == "*" || *t == event_type)
}

/// Structural sub-document match.
///
/// Every key present in the predicate must exist in the target with an equal
/// value. The string `"*"` as a predicate value matches any present value,
/// doubling as a key-presence check. Nested objects recurse; everything else
/// compares by equality. Keys absent from the predicate are unconstrained.
pub fn matches_structure(predicate: &Value, target: &Value) -> bool {
    match predicate {
        Value::Object(expected) => {
            let Value::Object(actual) = target else {
                return expected.is_empty();
            };
            expected.iter().all(|(key, value)| {
                actual.get(key).is_some_and(|found| matches_structure(value, found))
            })
        },
        Value::String(s) if s == "*" => true,
        _ => predicate == target,
    }
}

/// An empty (or null) predicate always matches.
fn is_empty_predicate(predicate: &Value) -> bool {
    match predicate {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::models::{EventId, ProjectId};

    fn event(event_type: &str, payload: Value, headers: HashMap<String, String>) -> Event {
        Event {
            id: EventId::new(),
            project_id: ProjectId::new(),
            event_type: event_type.to_string(),
            headers: sqlx::types::Json(headers),
            payload: serde_json::to_vec(&payload).unwrap(),
            created_at: Utc::now(),
        }
    }

    fn filter(event_types: &[&str], body: Value, headers: Value) -> FilterConfig {
        FilterConfig {
            event_types: event_types.iter().map(ToString::to_string).collect(),
            body,
            headers,
        }
    }

    #[test]
    fn wildcard_matches_every_event_type() {
        let f = filter(&["*"], json!({}), json!({}));
        for event_type in ["payment.created", "invoice.paid", "anything.else"] {
            assert!(matches(&event(event_type, json!({}), HashMap::new()), &f));
        }
    }

    #[test]
    fn empty_event_type_set_behaves_as_wildcard() {
        let f = filter(&[], json!({}), json!({}));
        assert!(matches(&event("payment.created", json!({}), HashMap::new()), &f));
    }

    #[test]
    fn exact_event_type_match_required_without_wildcard() {
        let f = filter(&["invoice.paid", "invoice.voided"], json!({}), json!({}));
        assert!(matches(&event("invoice.paid", json!({}), HashMap::new()), &f));
        assert!(matches(&event("invoice.voided", json!({}), HashMap::new()), &f));
        assert!(!matches(&event("invoice.created", json!({}), HashMap::new()), &f));
    }

    #[test]
    fn empty_body_predicate_ignores_payload_entirely() {
        let f = filter(&["*"], json!({}), json!({}));
        assert!(matches(&event("a", json!({"any": "thing"}), HashMap::new()), &f));

        // Even a payload that is not JSON at all.
        let mut ev = event("a", json!({}), HashMap::new());
        ev.payload = b"not json".to_vec();
        assert!(matches(&ev, &f));
    }

    #[test]
    fn body_predicate_requires_matching_keys() {
        let f = filter(&["*"], json!({"currency": "EUR"}), json!({}));
        assert!(matches(&event("a", json!({"currency": "EUR", "amount": 42}), HashMap::new()), &f));
        assert!(!matches(&event("a", json!({"currency": "USD"}), HashMap::new()), &f));
        assert!(!matches(&event("a", json!({"amount": 42}), HashMap::new()), &f));
    }

    #[test]
    fn body_predicate_recurses_into_nested_objects() {
        let f = filter(&["*"], json!({"customer": {"plan": "pro"}}), json!({}));
        assert!(matches(
            &event("a", json!({"customer": {"plan": "pro", "id": 7}}), HashMap::new()),
            &f
        ));
        assert!(!matches(
            &event("a", json!({"customer": {"plan": "free"}}), HashMap::new()),
            &f
        ));
    }

    #[test]
    fn wildcard_value_checks_key_presence_only() {
        let f = filter(&["*"], json!({"order_id": "*"}), json!({}));
        assert!(matches(&event("a", json!({"order_id": 991}), HashMap::new()), &f));
        assert!(matches(&event("a", json!({"order_id": null}), HashMap::new()), &f));
        assert!(!matches(&event("a", json!({"invoice_id": 991}), HashMap::new()), &f));
    }

    #[test]
    fn structured_body_predicate_never_matches_non_json_payload() {
        let f = filter(&["*"], json!({"kind": "x"}), json!({}));
        let mut ev = event("a", json!({}), HashMap::new());
        ev.payload = b"<xml/>".to_vec();
        assert!(!matches(&ev, &f));
    }

    #[test]
    fn header_predicate_matches_custom_headers() {
        let f = filter(&["*"], json!({}), json!({"x-region": "eu-west-1"}));
        let mut headers = HashMap::new();
        headers.insert("x-region".to_string(), "eu-west-1".to_string());
        assert!(matches(&event("a", json!({}), headers.clone()), &f));

        headers.insert("x-region".to_string(), "us-east-1".to_string());
        assert!(!matches(&event("a", json!({}), headers), &f));
        assert!(!matches(&event("a", json!({}), HashMap::new()), &f));
    }

    #[test]
    fn failing_either_predicate_yields_no_match() {
        let f = filter(&["*"], json!({"ok": true}), json!({"x-k": "v"}));
        let mut headers = HashMap::new();
        headers.insert("x-k".to_string(), "v".to_string());

        // Body matches, headers do not.
        assert!(!matches(&event("a", json!({"ok": true}), HashMap::new()), &f));
        // Headers match, body does not.
        assert!(!matches(&event("a", json!({"ok": false}), headers.clone()), &f));
        // Both match.
        assert!(matches(&event("a", json!({"ok": true}), headers), &f));
    }

    #[test]
    fn arrays_compare_by_equality() {
        let f = filter(&["*"], json!({"tags": ["a", "b"]}), json!({}));
        assert!(matches(&event("a", json!({"tags": ["a", "b"]}), HashMap::new()), &f));
        assert!(!matches(&event("a", json!({"tags": ["b", "a"]}), HashMap::new()), &f));
        assert!(!matches(&event("a", json!({"tags": ["a"]}), HashMap::new()), &f));
    }
}
