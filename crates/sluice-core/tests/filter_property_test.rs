//! Property tests for the subscription filter evaluator.
//!
//! Exercises the universal guarantees the fanout path relies on: wildcard
//! filters accept every event type, and empty predicates never inspect
//! payload or header content.

use std::collections::HashMap;

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;
use sluice_core::{
    filter,
    models::{Event, EventId, FilterConfig, ProjectId},
};

fn event_with(event_type: &str, payload: Vec<u8>, headers: HashMap<String, String>) -> Event {
    Event {
        id: EventId::new(),
        project_id: ProjectId::new(),
        event_type: event_type.to_string(),
        headers: sqlx::types::Json(headers),
        payload,
        created_at: Utc::now(),
    }
}

proptest! {
    #[test]
    fn wildcard_filter_matches_any_event_type(event_type in "[a-z]{1,12}(\\.[a-z]{1,12}){0,3}") {
        let filter_config = FilterConfig::match_all();
        let event = event_with(&event_type, b"{}".to_vec(), HashMap::new());
        prop_assert!(filter::matches(&event, &filter_config));
    }

    #[test]
    fn empty_predicates_ignore_payload_and_headers(
        event_type in "[a-z]{1,12}",
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        header_key in "[a-z-]{1,16}",
        header_value in "[ -~]{0,32}",
    ) {
        let filter_config = FilterConfig {
            event_types: vec![event_type.clone()],
            body: json!({}),
            headers: json!({}),
        };
        let mut headers = HashMap::new();
        headers.insert(header_key, header_value);

        // Arbitrary (possibly non-JSON) payload and arbitrary headers never
        // affect the outcome when both predicates are empty.
        let event = event_with(&event_type, payload, headers);
        prop_assert!(filter::matches(&event, &filter_config));
    }

    #[test]
    fn event_type_mismatch_never_matches(
        subscribed in "[a-z]{4,10}",
        submitted in "[A-Z]{4,10}",
    ) {
        let filter_config = FilterConfig {
            event_types: vec![subscribed],
            body: json!({}),
            headers: json!({}),
        };
        let event = event_with(&submitted, b"{}".to_vec(), HashMap::new());
        prop_assert!(!filter::matches(&event, &filter_config));
    }

    #[test]
    fn equality_predicate_is_reflexive(
        key in "[a-z]{1,10}",
        value in "[a-z0-9]{1,20}",
    ) {
        let filter_config = FilterConfig {
            event_types: vec!["*".to_string()],
            body: json!({ key.clone(): value.clone() }),
            headers: json!({}),
        };
        let payload = serde_json::to_vec(&json!({ key: value })).unwrap();
        let event = event_with("any", payload, HashMap::new());
        prop_assert!(filter::matches(&event, &filter_config));
    }
}
