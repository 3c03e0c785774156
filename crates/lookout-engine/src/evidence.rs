//! Per-tick raw observations feeding the track engine.
//!
//! Evidence is transient input: the engine consumes a batch per tick and
//! never stores items. Producer-assigned `entity_id`s are unstable across
//! ticks; association back to persistent tracks is the engine's job.

use serde::{Deserialize, Serialize};

use std::fmt;

// ---------------------------------------------------------------------------
// LineOfSight
// ---------------------------------------------------------------------------

/// Line-of-sight state reported by the perception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineOfSight {
    Visible,
    Occluded,
    Unknown,
}

impl LineOfSight {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visible => "visible",
            Self::Occluded => "occluded",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LineOfSight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PositionBucket
// ---------------------------------------------------------------------------

/// Quantized position on three axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionBucket {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl PositionBucket {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Manhattan distance over the quantized axes.
    pub fn manhattan_distance(&self, other: &Self) -> u64 {
        let dx = (i64::from(self.x) - i64::from(other.x)).unsigned_abs();
        let dy = (i64::from(self.y) - i64::from(other.y)).unsigned_abs();
        let dz = (i64::from(self.z) - i64::from(other.z)).unsigned_abs();
        dx + dy + dz
    }
}

impl fmt::Display for PositionBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// EvidenceItem / EvidenceBatch
// ---------------------------------------------------------------------------

/// One raw observation of one entity at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Producer-assigned transient id; may change across ticks for the same
    /// real entity.
    pub entity_id: u64,
    pub class_label: String,
    pub position: PositionBucket,
    /// Coarse distance bucket used for risk and movement-change detection.
    pub proximity_bucket: u32,
    pub los: LineOfSight,
    /// Opaque payload consumed by risk classification only. Never feeds
    /// track identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<serde_json::Value>,
}

/// All observations for one tick, in producer order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBatch {
    pub tick_id: u64,
    pub items: Vec<EvidenceItem>,
}

impl EvidenceBatch {
    pub fn new(tick_id: u64) -> Self {
        Self {
            tick_id,
            items: Vec::new(),
        }
    }

    pub fn with_items(tick_id: u64, items: Vec<EvidenceItem>) -> Self {
        Self { tick_id, items }
    }

    pub fn push(&mut self, item: EvidenceItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manhattan_distance_sums_axes() {
        let a = PositionBucket::new(5, 64, 0);
        let b = PositionBucket::new(3, 66, -1);
        assert_eq!(a.manhattan_distance(&b), 5);
        assert_eq!(b.manhattan_distance(&a), 5);
        assert_eq!(a.manhattan_distance(&a), 0);
    }

    #[test]
    fn manhattan_distance_survives_extreme_buckets() {
        let a = PositionBucket::new(i32::MIN, 0, 0);
        let b = PositionBucket::new(i32::MAX, 0, 0);
        assert_eq!(a.manhattan_distance(&b), u64::from(u32::MAX));
    }

    #[test]
    fn los_wire_form_is_snake_case() {
        let json = serde_json::to_string(&LineOfSight::Occluded).expect("serialize");
        assert_eq!(json, "\"occluded\"");
    }

    #[test]
    fn features_are_omitted_when_absent() {
        let item = EvidenceItem {
            entity_id: 42,
            class_label: "intruder".to_string(),
            position: PositionBucket::new(5, 64, 0),
            proximity_bucket: 2,
            los: LineOfSight::Visible,
            features: None,
        };
        let json = serde_json::to_string(&item).expect("serialize");
        assert!(!json.contains("features"));
    }
}
