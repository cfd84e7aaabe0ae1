use super::*;
use serde_json::json;

#[test]
fn test_round_trip_preserves_every_field() {
    let parent = Envelope::new("CreateWidget", json!({"name": "x"})).with_correlation_id("corr-1");
    let envelope = Envelope::caused_by(
        &parent,
        "WidgetCreated",
        json!({"name": "x", "tags": ["a", "b"], "weight": 0.1, "nested": {"n": null}}),
    )
    .next_attempt();

    let decoded = Envelope::decode(&envelope.encode()).unwrap();

    assert_eq!(decoded, envelope);
}

#[test]
fn test_round_trip_of_minimal_envelope() {
    let envelope = Envelope::new("Ping", Value::Null);
    assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
}

#[test]
fn test_wire_uses_type_field_name() {
    let envelope = Envelope::new("CreateWidget", json!({}));
    let raw: Value = serde_json::from_slice(&envelope.encode()).unwrap();

    assert_eq!(raw["type"], "CreateWidget");
    assert!(raw.get("message_type").is_none());
    assert!(raw.get("correlation_id").is_none());
}

#[test]
fn test_decode_defaults_attempt_count() {
    let body = br#"{
        "message_id": "6f1c1c52-8f0e-4b59-a4c4-3c1f0d9a7e21",
        "type": "CreateWidget",
        "payload": {"name": "x"},
        "occurred_at": "2024-03-01T12:00:00Z"
    }"#;

    let envelope = Envelope::decode(body).unwrap();
    assert_eq!(envelope.attempt_count, 0);
    assert_eq!(envelope.message_type, "CreateWidget");
}

#[test]
fn test_decode_without_occurred_at_stamps_receive_time() {
    let before = Utc::now();
    let body = br#"{"message_id":"6f1c1c52-8f0e-4b59-a4c4-3c1f0d9a7e21","type":"CreateWidget","payload":{"name":"x"}}"#;

    let envelope = Envelope::decode(body).unwrap();

    assert_eq!(envelope.message_type, "CreateWidget");
    assert_eq!(envelope.payload, json!({"name": "x"}));
    assert!(envelope.occurred_at >= before);
    assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
}

#[test]
fn test_decode_missing_message_id_is_malformed() {
    let body = br#"{"type": "CreateWidget", "payload": {}, "occurred_at": "2024-03-01T12:00:00Z"}"#;
    let err = Envelope::decode(body).unwrap_err();
    assert!(err.to_string().contains("message_id"), "{}", err);
}

#[test]
fn test_decode_missing_type_is_malformed() {
    let body = br#"{"message_id": "6f1c1c52-8f0e-4b59-a4c4-3c1f0d9a7e21", "occurred_at": "2024-03-01T12:00:00Z"}"#;
    assert!(matches!(Envelope::decode(body), Err(EnvelopeError::Malformed(_))));
}

#[test]
fn test_decode_rejects_nil_id_and_empty_type() {
    let mut envelope = Envelope::new("CreateWidget", json!({}));
    envelope.message_id = Uuid::nil();
    assert!(Envelope::decode(&envelope.encode()).is_err());

    let mut envelope = Envelope::new("CreateWidget", json!({}));
    envelope.message_type = "  ".to_string();
    assert!(Envelope::decode(&envelope.encode()).is_err());
}

#[test]
fn test_decode_garbage_is_malformed() {
    assert!(matches!(
        Envelope::decode(b"\x00\x01not json"),
        Err(EnvelopeError::Malformed(_))
    ));
}

#[test]
fn test_payload_as_reports_schema_mismatch() {
    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct CreateWidget {
        name: String,
    }

    let good = Envelope::new("CreateWidget", json!({"name": "x"}));
    assert_eq!(good.payload_as::<CreateWidget>().unwrap().name, "x");

    let bad = Envelope::new("CreateWidget", json!({"name": 42}));
    let err = bad.payload_as::<CreateWidget>().unwrap_err();
    assert!(err.to_string().contains("CreateWidget"));
}

#[test]
fn test_caused_by_propagates_correlation() {
    let root = Envelope::new("CreateWidget", json!({}));
    let child = Envelope::caused_by(&root, "WidgetCreated", json!({}));
    assert_eq!(child.causation_id, Some(root.message_id));
    assert_eq!(child.correlation_id, Some(root.message_id.to_string()));

    let grandchild = Envelope::caused_by(&child, "WidgetAudited", json!({}));
    assert_eq!(grandchild.correlation_id, child.correlation_id);
    assert_ne!(grandchild.message_id, child.message_id);
}

#[test]
fn test_next_attempt_keeps_identity() {
    let envelope = Envelope::new("CreateWidget", json!({}));
    let retry = envelope.next_attempt().next_attempt();
    assert_eq!(retry.message_id, envelope.message_id);
    assert_eq!(retry.attempt_count, 2);
}
