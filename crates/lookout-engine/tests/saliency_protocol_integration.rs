#![forbid(unsafe_code)]
//! Integration tests for the `saliency_protocol` wire contracts.

use lookout_engine::evidence::PositionBucket;
use lookout_engine::risk::RiskLevel;
use lookout_engine::saliency_protocol::{
    error_code, Envelope, EnvelopePublisher, ProtocolError, SaliencyDelta,
    DEFAULT_SNAPSHOT_INTERVAL, REQUEST_KIND, SCHEMA_VERSION, SUPPORTED_SCHEMA_VERSIONS,
};
use lookout_engine::track::{TrackSummary, Visibility};
use lookout_engine::track_identity::{class_enum_code, derive_track_id};

fn summary(disambiguator: u64) -> TrackSummary {
    let position = PositionBucket::new(5, 64, 0);
    let class_enum = class_enum_code("intruder");
    TrackSummary {
        track_id: derive_track_id(1, &position, class_enum, disambiguator),
        class_label: "intruder".to_string(),
        class_enum,
        pos_bucket_x: position.x,
        pos_bucket_y: position.y,
        pos_bucket_z: position.z,
        proximity_bucket: 2,
        visibility: Visibility::Visible,
        risk_level: RiskLevel::Critical,
        confidence: 500_000,
        p_unknown: 0,
        first_seen_tick: 1,
        last_seen_tick: 1,
    }
}

#[test]
fn envelope_wire_form_matches_the_contract() {
    let mut publisher = EnvelopePublisher::new("bot-1", 3, DEFAULT_SNAPSHOT_INTERVAL);
    let track = summary(0);
    let deltas = vec![SaliencyDelta::NewThreat {
        track_id: track.track_id,
        class_label: track.class_label.clone(),
        risk_level: track.risk_level,
        proximity_bucket: track.proximity_bucket,
        track: Some(track.clone()),
    }];
    let envelope = publisher.publish(9, deltas, || vec![track.clone()]);

    let json = serde_json::to_value(&envelope).expect("serialize");
    assert_eq!(json["schema_version"], SCHEMA_VERSION);
    assert_eq!(json["request_kind"], "saliency_delta");
    assert_eq!(json["bot_id"], "bot-1");
    assert_eq!(json["seq"], 0);
    assert_eq!(json["tick_id"], 9);
    assert_eq!(json["snapshot"]["tick_id"], 9);
    assert_eq!(json["saliency_events"][0]["type"], "new_threat");
    assert_eq!(json["saliency_events"][0]["risk_level"], "critical");
    assert!(json["saliency_events"][0]["track"].is_object());
}

#[test]
fn envelopes_survive_a_wire_round_trip() {
    let mut publisher = EnvelopePublisher::new("bot-1", 3, 1);
    let track = summary(4);
    let deltas = vec![SaliencyDelta::Reclassified {
        track_id: track.track_id,
        class_label: track.class_label.clone(),
        risk_level: RiskLevel::Moderate,
        proximity_bucket: 2,
        prev_risk: RiskLevel::Critical,
    }];
    let envelope = publisher.publish(3, deltas, || vec![track]);

    let bytes = serde_json::to_vec(&envelope).expect("serialize");
    let parsed: Envelope = serde_json::from_slice(&bytes).expect("parse");
    assert_eq!(parsed, envelope);
    parsed.validate(SUPPORTED_SCHEMA_VERSIONS).expect("valid");
}

#[test]
fn version_whitelist_fails_closed() {
    let mut publisher = EnvelopePublisher::new("bot-1", 3, 1);
    let mut envelope = publisher.publish(1, Vec::new(), Vec::new);
    envelope.schema_version = "lookout.saliency-delta.v7".to_string();

    let err = envelope
        .validate(SUPPORTED_SCHEMA_VERSIONS)
        .expect_err("unknown version");
    assert!(matches!(err, ProtocolError::UnsupportedSchemaVersion { .. }));
    assert_eq!(error_code(&err), "LK_PROTOCOL_BAD_SCHEMA");
    assert!(err.to_string().contains(SCHEMA_VERSION));

    let mut envelope = publisher.publish(2, Vec::new(), Vec::new);
    envelope.request_kind = "metrics".to_string();
    let err = envelope
        .validate(SUPPORTED_SCHEMA_VERSIONS)
        .expect_err("wrong kind");
    assert_eq!(error_code(&err), "LK_PROTOCOL_BAD_KIND");
    assert!(err.to_string().contains(REQUEST_KIND));
}

#[test]
fn publisher_restart_changes_stream_identity_but_not_bot_identity() {
    let first = EnvelopePublisher::new("bot-1", 100, 1);
    let second = EnvelopePublisher::new("bot-1", 101, 1);
    assert_eq!(first.bot_id(), second.bot_id());
    assert_ne!(first.stream_id(), second.stream_id());
}

#[test]
fn snapshot_cadence_always_covers_the_first_envelope() {
    for interval in [0u64, 1, 3, DEFAULT_SNAPSHOT_INTERVAL] {
        let mut publisher = EnvelopePublisher::new("bot-1", 9, interval);
        let envelope = publisher.publish(1, Vec::new(), || vec![summary(0)]);
        assert!(
            envelope.snapshot.is_some(),
            "interval {interval}: first envelope must carry a snapshot"
        );
    }
}
