//! Persistent per-entity track state and its wire-facing projection.
//!
//! `Track` is the engine's mutable unit of state; `TrackSummary` is the
//! immutable projection that crosses the wire. Engine-internal bookkeeping
//! (staleness counters, association hints, warmup/cooldown state) never
//! appears in a summary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::evidence::PositionBucket;
use crate::risk::RiskLevel;
use crate::track_identity::TrackId;

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

/// Track lifecycle visibility.
///
/// Visible/Inferred tracks participate in downstream prioritization; Lost
/// tracks are retained only until eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Visible,
    Inferred,
    Lost,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visible => "visible",
            Self::Inferred => "inferred",
            Self::Lost => "lost",
        }
    }

    pub fn is_lost(self) -> bool {
        matches!(self, Self::Lost)
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Track — engine-internal state
// ---------------------------------------------------------------------------

/// Engine-internal state for one tracked entity.
///
/// Fields below the marker comment are bookkeeping that never crosses the
/// wire; everything above is projected into `TrackSummary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: TrackId,
    pub class_label: String,
    pub class_enum: u32,
    pub position: PositionBucket,
    pub proximity_bucket: u32,
    /// Fixed-point millionths, clamped to [confidence_floor, 1.0].
    pub confidence: u32,
    /// Fixed-point millionths, clamped to [0, 1.0].
    pub p_unknown: u32,
    pub visibility: Visibility,
    pub risk_level: RiskLevel,
    pub first_seen_tick: u64,
    pub last_seen_tick: u64,

    // Engine-internal bookkeeping, not exposed downstream.
    pub ticks_since_observed: u64,
    /// Producer's transient entity id at the last observation; association
    /// hint only.
    pub last_entity_id: u64,
    /// Observations accumulated toward the warmup announcement.
    pub observation_count: u32,
    /// Whether the one-shot `new_threat` announcement has fired.
    pub announced: bool,
    /// Tick at which the last `reclassified` delta fired, for cooldown.
    pub last_reclassified_at: Option<u64>,
    /// Tick at which the last `movement_bucket_change` delta fired.
    pub last_movement_at: Option<u64>,
}

impl Track {
    /// Wire-facing projection.
    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            track_id: self.track_id,
            class_label: self.class_label.clone(),
            class_enum: self.class_enum,
            pos_bucket_x: self.position.x,
            pos_bucket_y: self.position.y,
            pos_bucket_z: self.position.z,
            proximity_bucket: self.proximity_bucket,
            visibility: self.visibility,
            risk_level: self.risk_level,
            confidence: self.confidence,
            p_unknown: self.p_unknown,
            first_seen_tick: self.first_seen_tick,
            last_seen_tick: self.last_seen_tick,
        }
    }
}

// ---------------------------------------------------------------------------
// TrackSummary — wire projection
// ---------------------------------------------------------------------------

/// Wire-facing summary of one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub track_id: TrackId,
    pub class_label: String,
    pub class_enum: u32,
    pub pos_bucket_x: i32,
    pub pos_bucket_y: i32,
    pub pos_bucket_z: i32,
    pub proximity_bucket: u32,
    pub visibility: Visibility,
    pub risk_level: RiskLevel,
    pub confidence: u32,
    pub p_unknown: u32,
    pub first_seen_tick: u64,
    pub last_seen_tick: u64,
}

impl TrackSummary {
    pub fn position(&self) -> PositionBucket {
        PositionBucket::new(self.pos_bucket_x, self.pos_bucket_y, self.pos_bucket_z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track_identity::{class_enum_code, derive_track_id};

    fn sample_track() -> Track {
        let position = PositionBucket::new(5, 64, 0);
        let class_enum = class_enum_code("intruder");
        Track {
            track_id: derive_track_id(1, &position, class_enum, 0),
            class_label: "intruder".to_string(),
            class_enum,
            position,
            proximity_bucket: 2,
            confidence: 350_000,
            p_unknown: 0,
            visibility: Visibility::Visible,
            risk_level: RiskLevel::Critical,
            first_seen_tick: 1,
            last_seen_tick: 1,
            ticks_since_observed: 0,
            last_entity_id: 42,
            observation_count: 1,
            announced: false,
            last_reclassified_at: None,
            last_movement_at: None,
        }
    }

    #[test]
    fn summary_projects_public_fields() {
        let track = sample_track();
        let summary = track.summary();
        assert_eq!(summary.track_id, track.track_id);
        assert_eq!(summary.pos_bucket_x, 5);
        assert_eq!(summary.pos_bucket_y, 64);
        assert_eq!(summary.pos_bucket_z, 0);
        assert_eq!(summary.position(), track.position);
        assert_eq!(summary.first_seen_tick, 1);
    }

    #[test]
    fn summary_wire_form_never_carries_bookkeeping() {
        let json = serde_json::to_value(sample_track().summary()).expect("serialize");
        let object = json.as_object().expect("object");
        assert!(!object.contains_key("ticks_since_observed"));
        assert!(!object.contains_key("last_entity_id"));
        assert!(!object.contains_key("observation_count"));
        assert!(!object.contains_key("announced"));
    }

    #[test]
    fn visibility_wire_form_is_snake_case() {
        let json = serde_json::to_string(&Visibility::Inferred).expect("serialize");
        assert_eq!(json, "\"inferred\"");
    }
}
