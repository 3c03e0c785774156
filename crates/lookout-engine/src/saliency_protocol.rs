//! Snapshot/delta wire contracts and the producer-side envelope publisher.
//!
//! The envelope is the wire unit: versioned, per-stream sequenced, carrying
//! an optional full snapshot plus incremental saliency deltas. Producer and
//! consumer each hold an explicit whitelist of supported schema versions;
//! anything outside the whitelist fails immediately rather than being
//! best-effort parsed.
//!
//! Envelopes are produced once and consumed once. Idempotent replay is not
//! guaranteed at this layer; the consumer's sequence checks provide it.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::risk::RiskLevel;
use crate::track::TrackSummary;
use crate::track_identity::TrackId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Schema version emitted by this producer.
pub const SCHEMA_VERSION: &str = "lookout.saliency-delta.v1";

/// Versions this implementation can parse. Fail closed on anything else.
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &[SCHEMA_VERSION];

/// The only request kind carried on this stream.
pub const REQUEST_KIND: &str = "saliency_delta";

/// Domain-separation prefix for stream id derivation.
const STREAM_ID_DOMAIN: &[u8] = b"lookout.stream-id.v1";

/// Default cadence: every Nth envelope carries a full snapshot.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 16;

// ---------------------------------------------------------------------------
// SaliencyDelta
// ---------------------------------------------------------------------------

/// Incremental change notification about one track.
///
/// `NewThreat` must carry the full inline summary; the field stays optional
/// on the wire so a consumer can observe (and reject) a violating producer
/// instead of failing to parse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SaliencyDelta {
    NewThreat {
        track_id: TrackId,
        class_label: String,
        risk_level: RiskLevel,
        proximity_bucket: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        track: Option<TrackSummary>,
    },
    TrackLost {
        track_id: TrackId,
        class_label: String,
        risk_level: RiskLevel,
        proximity_bucket: u32,
    },
    Reclassified {
        track_id: TrackId,
        class_label: String,
        risk_level: RiskLevel,
        proximity_bucket: u32,
        prev_risk: RiskLevel,
    },
    MovementBucketChange {
        track_id: TrackId,
        class_label: String,
        risk_level: RiskLevel,
        proximity_bucket: u32,
        prev_proximity_bucket: u32,
    },
}

impl SaliencyDelta {
    pub fn kind(&self) -> SaliencyDeltaKind {
        match self {
            Self::NewThreat { .. } => SaliencyDeltaKind::NewThreat,
            Self::TrackLost { .. } => SaliencyDeltaKind::TrackLost,
            Self::Reclassified { .. } => SaliencyDeltaKind::Reclassified,
            Self::MovementBucketChange { .. } => SaliencyDeltaKind::MovementBucketChange,
        }
    }

    pub fn track_id(&self) -> TrackId {
        match self {
            Self::NewThreat { track_id, .. }
            | Self::TrackLost { track_id, .. }
            | Self::Reclassified { track_id, .. }
            | Self::MovementBucketChange { track_id, .. } => *track_id,
        }
    }

    pub fn risk_level(&self) -> RiskLevel {
        match self {
            Self::NewThreat { risk_level, .. }
            | Self::TrackLost { risk_level, .. }
            | Self::Reclassified { risk_level, .. }
            | Self::MovementBucketChange { risk_level, .. } => *risk_level,
        }
    }
}

/// Delta discriminator, matching the wire `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaliencyDeltaKind {
    NewThreat,
    TrackLost,
    Reclassified,
    MovementBucketChange,
}

impl SaliencyDeltaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewThreat => "new_threat",
            Self::TrackLost => "track_lost",
            Self::Reclassified => "reclassified",
            Self::MovementBucketChange => "movement_bucket_change",
        }
    }
}

impl fmt::Display for SaliencyDeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SnapshotPayload / Envelope
// ---------------------------------------------------------------------------

/// Full state snapshot; replaces all consumer-side state when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub tick_id: u64,
    pub tracks: Vec<TrackSummary>,
}

/// The wire unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: String,
    pub request_kind: String,
    /// Stable across producer restarts.
    pub bot_id: String,
    /// Changes every producer instantiation.
    pub stream_id: String,
    /// Monotonic per stream, starting at 0.
    pub seq: u64,
    pub tick_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotPayload>,
    pub saliency_events: Vec<SaliencyDelta>,
}

impl Envelope {
    /// Fail-closed validation against a schema whitelist.
    pub fn validate(&self, supported_versions: &[&str]) -> Result<(), ProtocolError> {
        if !supported_versions.contains(&self.schema_version.as_str()) {
            return Err(ProtocolError::UnsupportedSchemaVersion {
                actual: self.schema_version.clone(),
            });
        }
        if self.request_kind != REQUEST_KIND {
            return Err(ProtocolError::UnexpectedRequestKind {
                actual: self.request_kind.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Schema version outside the declared whitelist.
    UnsupportedSchemaVersion { actual: String },
    /// Request kind other than `saliency_delta`.
    UnexpectedRequestKind { actual: String },
    /// A `new_threat` delta arrived without its inline summary.
    MissingNewThreatSummary { track_id: TrackId },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedSchemaVersion { actual } => write!(
                f,
                "unsupported schema version `{actual}` (supported: {})",
                SUPPORTED_SCHEMA_VERSIONS.join(", ")
            ),
            Self::UnexpectedRequestKind { actual } => {
                write!(f, "unexpected request kind `{actual}` (expected `{REQUEST_KIND}`)")
            }
            Self::MissingNewThreatSummary { track_id } => {
                write!(f, "new_threat for {track_id} carries no inline track summary")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Stable error code for structured logging and artifacts.
pub fn error_code(err: &ProtocolError) -> &'static str {
    match err {
        ProtocolError::UnsupportedSchemaVersion { .. } => "LK_PROTOCOL_BAD_SCHEMA",
        ProtocolError::UnexpectedRequestKind { .. } => "LK_PROTOCOL_BAD_KIND",
        ProtocolError::MissingNewThreatSummary { .. } => "LK_PROTOCOL_NAKED_NEW_THREAT",
    }
}

// ---------------------------------------------------------------------------
// EnvelopePublisher — producer-side sequencing and snapshot cadence
// ---------------------------------------------------------------------------

/// Producer-side wrapper that turns engine output into envelopes.
///
/// Owns the per-instantiation stream identity and the monotonic sequence.
/// The first envelope of a stream and every `snapshot_interval`-th envelope
/// thereafter carry a full snapshot so a consumer can always recover from
/// the stream itself.
#[derive(Debug, Clone)]
pub struct EnvelopePublisher {
    bot_id: String,
    stream_id: String,
    next_seq: u64,
    envelopes_emitted: u64,
    snapshot_interval: u64,
}

impl EnvelopePublisher {
    /// `instance_nonce` distinguishes process instantiations of the same
    /// bot; the caller supplies it (restart counter, random draw, pid).
    pub fn new(bot_id: impl Into<String>, instance_nonce: u64, snapshot_interval: u64) -> Self {
        let bot_id = bot_id.into();
        let stream_id = derive_stream_id(&bot_id, instance_nonce);
        Self {
            bot_id,
            stream_id,
            next_seq: 0,
            envelopes_emitted: 0,
            snapshot_interval,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Whether the next published envelope will carry a snapshot.
    pub fn snapshot_due(&self) -> bool {
        self.envelopes_emitted == 0
            || (self.snapshot_interval > 0
                && self.envelopes_emitted.is_multiple_of(self.snapshot_interval))
    }

    /// Wrap one tick's deltas into an envelope. `view` is invoked only when
    /// a snapshot is due.
    pub fn publish(
        &mut self,
        tick_id: u64,
        deltas: Vec<SaliencyDelta>,
        view: impl FnOnce() -> Vec<TrackSummary>,
    ) -> Envelope {
        let snapshot = if self.snapshot_due() {
            Some(SnapshotPayload {
                tick_id,
                tracks: view(),
            })
        } else {
            None
        };

        let envelope = Envelope {
            schema_version: SCHEMA_VERSION.to_string(),
            request_kind: REQUEST_KIND.to_string(),
            bot_id: self.bot_id.clone(),
            stream_id: self.stream_id.clone(),
            seq: self.next_seq,
            tick_id,
            snapshot,
            saliency_events: deltas,
        };

        self.next_seq += 1;
        self.envelopes_emitted += 1;
        envelope
    }
}

fn derive_stream_id(bot_id: &str, instance_nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(STREAM_ID_DOMAIN);
    hasher.update(bot_id.as_bytes());
    hasher.update(instance_nonce.to_be_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(24);
    for byte in &digest[..12] {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("stream-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::PositionBucket;
    use crate::track::Visibility;
    use crate::track_identity::{class_enum_code, derive_track_id};

    fn summary(tick: u64) -> TrackSummary {
        let position = PositionBucket::new(5, 64, 0);
        let class_enum = class_enum_code("intruder");
        TrackSummary {
            track_id: derive_track_id(tick, &position, class_enum, 0),
            class_label: "intruder".to_string(),
            class_enum,
            pos_bucket_x: 5,
            pos_bucket_y: 64,
            pos_bucket_z: 0,
            proximity_bucket: 2,
            visibility: Visibility::Visible,
            risk_level: RiskLevel::Critical,
            confidence: 500_000,
            p_unknown: 0,
            first_seen_tick: tick,
            last_seen_tick: tick,
        }
    }

    #[test]
    fn delta_wire_form_uses_type_tag() {
        let s = summary(1);
        let delta = SaliencyDelta::NewThreat {
            track_id: s.track_id,
            class_label: s.class_label.clone(),
            risk_level: s.risk_level,
            proximity_bucket: s.proximity_bucket,
            track: Some(s),
        };
        let json = serde_json::to_value(&delta).expect("serialize");
        assert_eq!(json["type"], "new_threat");
        assert!(json["track"].is_object());

        let lost = SaliencyDelta::TrackLost {
            track_id: delta.track_id(),
            class_label: "intruder".to_string(),
            risk_level: RiskLevel::Low,
            proximity_bucket: 3,
        };
        let json = serde_json::to_value(&lost).expect("serialize");
        assert_eq!(json["type"], "track_lost");
        assert!(json.get("track").is_none());
    }

    #[test]
    fn naked_new_threat_is_representable_on_the_wire() {
        let s = summary(1);
        let raw = serde_json::json!({
            "type": "new_threat",
            "track_id": s.track_id,
            "class_label": "intruder",
            "risk_level": "critical",
            "proximity_bucket": 2,
        });
        let delta: SaliencyDelta = serde_json::from_value(raw).expect("parse");
        match delta {
            SaliencyDelta::NewThreat { track, .. } => assert!(track.is_none()),
            other => panic!("unexpected delta {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_unknown_schema_version() {
        let envelope = Envelope {
            schema_version: "lookout.saliency-delta.v9".to_string(),
            request_kind: REQUEST_KIND.to_string(),
            bot_id: "bot-1".to_string(),
            stream_id: "stream-a".to_string(),
            seq: 0,
            tick_id: 1,
            snapshot: None,
            saliency_events: Vec::new(),
        };
        let err = envelope
            .validate(SUPPORTED_SCHEMA_VERSIONS)
            .expect_err("must fail closed");
        assert_eq!(error_code(&err), "LK_PROTOCOL_BAD_SCHEMA");
    }

    #[test]
    fn validate_rejects_unexpected_request_kind() {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION.to_string(),
            request_kind: "telemetry".to_string(),
            bot_id: "bot-1".to_string(),
            stream_id: "stream-a".to_string(),
            seq: 0,
            tick_id: 1,
            snapshot: None,
            saliency_events: Vec::new(),
        };
        let err = envelope
            .validate(SUPPORTED_SCHEMA_VERSIONS)
            .expect_err("must fail closed");
        assert_eq!(error_code(&err), "LK_PROTOCOL_BAD_KIND");
    }

    #[test]
    fn publisher_sequences_monotonically_and_snapshots_on_cadence() {
        let mut publisher = EnvelopePublisher::new("bot-1", 7, 4);
        let mut snapshots = Vec::new();
        for tick in 0..9 {
            let envelope = publisher.publish(tick, Vec::new(), || vec![summary(tick)]);
            assert_eq!(envelope.seq, tick);
            assert_eq!(envelope.schema_version, SCHEMA_VERSION);
            snapshots.push(envelope.snapshot.is_some());
        }
        assert_eq!(
            snapshots,
            vec![true, false, false, false, true, false, false, false, true]
        );
    }

    #[test]
    fn instantiations_get_distinct_stream_ids() {
        let a = EnvelopePublisher::new("bot-1", 1, DEFAULT_SNAPSHOT_INTERVAL);
        let b = EnvelopePublisher::new("bot-1", 2, DEFAULT_SNAPSHOT_INTERVAL);
        assert_ne!(a.stream_id(), b.stream_id());
        assert!(a.stream_id().starts_with("stream-"));

        let a_again = EnvelopePublisher::new("bot-1", 1, DEFAULT_SNAPSHOT_INTERVAL);
        assert_eq!(a.stream_id(), a_again.stream_id());
    }
}
