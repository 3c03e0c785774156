//! Bounded track engine: association, warmup, decay, risk dynamics,
//! eviction.
//!
//! The engine is a synchronous reducer over explicit state: `ingest` folds
//! one evidence batch in, `tick` ages everything that was not observed.
//! Ordinary evidence never produces an error; the only fallible surfaces
//! are construction (config validation, extension gating) and the gated
//! detailed-risk path.
//!
//! Fixed-point millionths (1_000_000 = 1.0) for confidence and uncertainty.
//! `BTreeMap` keyed by `TrackId` gives deterministic iteration and the
//! byte-order tie-break everywhere a victim must be chosen.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evidence::{EvidenceBatch, EvidenceItem, LineOfSight};
use crate::risk::{MILLIONTHS_ONE, RiskBreakdown, RiskClassifier, RiskError, RiskLevel};
use crate::saliency_protocol::SaliencyDelta;
use crate::track::{Track, TrackSummary, Visibility};
use crate::track_identity::{TrackId, class_enum_code, derive_track_id};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const COMPONENT: &str = "track_engine";

const DEFAULT_TRACK_CAP: usize = 48;
const DEFAULT_WARMUP_OBSERVATIONS: u32 = 2;
const DEFAULT_DELTA_COOLDOWN_TICKS: u64 = 10;
const DEFAULT_INFERRED_AFTER_TICKS: u64 = 3;
const DEFAULT_LOST_AFTER_TICKS: u64 = 12;
const DEFAULT_EVICT_AFTER_TICKS: u64 = 36;
const DEFAULT_ASSOCIATION_RADIUS: u64 = 2;

const DEFAULT_CONFIDENCE_FLOOR: u32 = 50_000;
const DEFAULT_INITIAL_CONFIDENCE: u32 = 350_000;
const DEFAULT_CONFIDENCE_DECAY: u32 = 25_000;
const DEFAULT_P_UNKNOWN_GROWTH: u32 = 40_000;

// ---------------------------------------------------------------------------
// LosProfile — line-of-sight dependent amounts
// ---------------------------------------------------------------------------

/// Per-line-of-sight amounts in millionths. A valid profile is strictly
/// ordered visible > unknown > occluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LosProfile {
    pub visible: u32,
    pub unknown: u32,
    pub occluded: u32,
}

impl LosProfile {
    pub fn amount(&self, los: LineOfSight) -> u32 {
        match los {
            LineOfSight::Visible => self.visible,
            LineOfSight::Unknown => self.unknown,
            LineOfSight::Occluded => self.occluded,
        }
    }

    fn is_strictly_ordered(&self) -> bool {
        self.visible > self.unknown && self.unknown > self.occluded
    }
}

// ---------------------------------------------------------------------------
// TrackEngineConfig
// ---------------------------------------------------------------------------

/// Policy constants for the engine. Literal values are tuned, not
/// load-bearing; the ordering relationships are enforced by `validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEngineConfig {
    /// Hard bound on concurrent tracks.
    pub track_cap: usize,
    /// Observations required before the one-shot `new_threat` announcement.
    pub warmup_observations: u32,
    /// Minimum ticks between deltas of the same kind for the same track.
    pub delta_cooldown_ticks: u64,
    /// Unobserved ticks before a visible track becomes inferred.
    pub inferred_after_ticks: u64,
    /// Unobserved ticks before a track becomes lost.
    pub lost_after_ticks: u64,
    /// Unobserved ticks before a track is evicted.
    pub evict_after_ticks: u64,
    /// Manhattan radius (position buckets) for fallback association.
    pub association_radius: u64,
    pub confidence_floor: u32,
    pub initial_confidence: u32,
    /// Confidence gained on observation, by line of sight.
    pub confidence_boost: LosProfile,
    /// Confidence lost per unobserved tick.
    pub confidence_decay: u32,
    /// Uncertainty recovered on observation, by line of sight.
    pub p_unknown_recovery: LosProfile,
    /// Uncertainty gained per unobserved tick.
    pub p_unknown_growth: u32,
    /// Declares that callers will use the detailed-risk extension.
    pub want_detailed_risk: bool,
}

impl Default for TrackEngineConfig {
    fn default() -> Self {
        Self {
            track_cap: DEFAULT_TRACK_CAP,
            warmup_observations: DEFAULT_WARMUP_OBSERVATIONS,
            delta_cooldown_ticks: DEFAULT_DELTA_COOLDOWN_TICKS,
            inferred_after_ticks: DEFAULT_INFERRED_AFTER_TICKS,
            lost_after_ticks: DEFAULT_LOST_AFTER_TICKS,
            evict_after_ticks: DEFAULT_EVICT_AFTER_TICKS,
            association_radius: DEFAULT_ASSOCIATION_RADIUS,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            initial_confidence: DEFAULT_INITIAL_CONFIDENCE,
            confidence_boost: LosProfile {
                visible: 150_000,
                unknown: 80_000,
                occluded: 40_000,
            },
            confidence_decay: DEFAULT_CONFIDENCE_DECAY,
            p_unknown_recovery: LosProfile {
                visible: 120_000,
                unknown: 60_000,
                occluded: 30_000,
            },
            p_unknown_growth: DEFAULT_P_UNKNOWN_GROWTH,
            want_detailed_risk: false,
        }
    }
}

impl TrackEngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.track_cap == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "track_cap must be at least 1".to_string(),
            });
        }
        if self.warmup_observations == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "warmup_observations must be at least 1".to_string(),
            });
        }
        if self.inferred_after_ticks >= self.lost_after_ticks {
            return Err(EngineError::InvalidConfig {
                reason: "inferred_after_ticks must be below lost_after_ticks".to_string(),
            });
        }
        if self.lost_after_ticks >= self.evict_after_ticks {
            return Err(EngineError::InvalidConfig {
                reason: "lost_after_ticks must be below evict_after_ticks".to_string(),
            });
        }
        if self.confidence_floor > self.initial_confidence
            || self.initial_confidence > MILLIONTHS_ONE
        {
            return Err(EngineError::InvalidConfig {
                reason: "confidence must satisfy floor <= initial <= 1.0".to_string(),
            });
        }
        if !self.confidence_boost.is_strictly_ordered() {
            return Err(EngineError::InvalidConfig {
                reason: "confidence_boost must be ordered visible > unknown > occluded".to_string(),
            });
        }
        if !self.p_unknown_recovery.is_strictly_ordered() {
            return Err(EngineError::InvalidConfig {
                reason: "p_unknown_recovery must be ordered visible > unknown > occluded"
                    .to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid track engine config: {reason}")]
    InvalidConfig { reason: String },
    /// Config declared the detailed-risk extension but the classifier does
    /// not implement it. Raised at construction, not first use.
    #[error("detailed risk was declared but the classifier does not support it")]
    DetailedRiskUnsupported,
    /// The detailed-risk path was invoked without declaring it.
    #[error("detailed risk was not declared in the engine config")]
    DetailedRiskNotDeclared,
    #[error("unknown track {track_id}")]
    UnknownTrack { track_id: TrackId },
    #[error(transparent)]
    Risk(#[from] RiskError),
}

/// Stable error code for structured logging and artifacts.
pub fn error_code(err: &EngineError) -> &'static str {
    match err {
        EngineError::InvalidConfig { .. } => "LK_ENGINE_INVALID_CONFIG",
        EngineError::DetailedRiskUnsupported => "LK_ENGINE_DETAILED_RISK_UNSUPPORTED",
        EngineError::DetailedRiskNotDeclared => "LK_ENGINE_DETAILED_RISK_NOT_DECLARED",
        EngineError::UnknownTrack { .. } => "LK_ENGINE_UNKNOWN_TRACK",
        EngineError::Risk(_) => "LK_RISK_DETAILED_UNSUPPORTED",
    }
}

// ---------------------------------------------------------------------------
// TrackEngine
// ---------------------------------------------------------------------------

/// Owns the bounded track set. One instance per producer process; callers
/// serialize `ingest`/`tick` per tick.
pub struct TrackEngine {
    config: TrackEngineConfig,
    classifier: Box<dyn RiskClassifier>,
    tracks: BTreeMap<TrackId, Track>,
    /// Producer entity id -> track, for fast exact re-association.
    entity_index: BTreeMap<u64, TrackId>,
    next_disambiguator: u64,
}

impl fmt::Debug for TrackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackEngine")
            .field("config", &self.config)
            .field("tracks", &self.tracks.len())
            .field("next_disambiguator", &self.next_disambiguator)
            .finish()
    }
}

impl TrackEngine {
    /// Fails closed when the config declares the detailed-risk extension
    /// but the classifier does not advertise it.
    pub fn new(
        config: TrackEngineConfig,
        classifier: Box<dyn RiskClassifier>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if config.want_detailed_risk && !classifier.supports_detailed() {
            return Err(EngineError::DetailedRiskUnsupported);
        }
        Ok(Self {
            config,
            classifier,
            tracks: BTreeMap::new(),
            entity_index: BTreeMap::new(),
            next_disambiguator: 0,
        })
    }

    pub fn config(&self) -> &TrackEngineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, track_id: &TrackId) -> Option<&Track> {
        self.tracks.get(track_id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Wire-facing view of every track, in id order.
    pub fn summaries(&self) -> Vec<TrackSummary> {
        self.tracks.values().map(Track::summary).collect()
    }

    /// Delegate to the domain classifier.
    pub fn classify(&self, class_label: &str, proximity_bucket: u32, p_unknown: u32) -> RiskLevel {
        self.classifier.classify(class_label, proximity_bucket, p_unknown)
    }

    /// Extension-gated detailed breakdown for one track.
    pub fn detailed_risk(&self, track_id: &TrackId) -> Result<RiskBreakdown, EngineError> {
        if !self.config.want_detailed_risk {
            return Err(EngineError::DetailedRiskNotDeclared);
        }
        let track = self
            .tracks
            .get(track_id)
            .ok_or(EngineError::UnknownTrack { track_id: *track_id })?;
        Ok(self.classifier.classify_detailed(
            &track.class_label,
            track.proximity_bucket,
            track.p_unknown,
        )?)
    }

    /// Fold one evidence batch into the track set.
    pub fn ingest(&mut self, batch: &EvidenceBatch) -> Vec<SaliencyDelta> {
        let mut deltas = Vec::new();
        for item in &batch.items {
            match self.associate(item) {
                Some(track_id) => self.update_track(track_id, item, batch.tick_id, &mut deltas),
                None => self.create_track(item, batch.tick_id, &mut deltas),
            }
        }
        deltas
    }

    /// Age every track that was not observed at `tick_id`.
    pub fn tick(&mut self, tick_id: u64) -> Vec<SaliencyDelta> {
        let mut deltas = Vec::new();
        let mut evicted = Vec::new();

        for (track_id, track) in self.tracks.iter_mut() {
            if track.last_seen_tick == tick_id {
                continue;
            }
            track.ticks_since_observed += 1;
            track.confidence = decay_toward_floor(
                track.confidence,
                self.config.confidence_decay,
                self.config.confidence_floor,
            );
            track.p_unknown = grow_toward_one(track.p_unknown, self.config.p_unknown_growth);

            let prev_risk = track.risk_level;
            track.risk_level = self.classifier.classify(
                &track.class_label,
                track.proximity_bucket,
                track.p_unknown,
            );

            let prev_visibility = track.visibility;
            if track.ticks_since_observed >= self.config.lost_after_ticks {
                track.visibility = Visibility::Lost;
            } else if track.ticks_since_observed >= self.config.inferred_after_ticks
                && track.visibility == Visibility::Visible
            {
                track.visibility = Visibility::Inferred;
            }

            if !prev_visibility.is_lost() && track.visibility.is_lost() {
                deltas.push(SaliencyDelta::TrackLost {
                    track_id: *track_id,
                    class_label: track.class_label.clone(),
                    risk_level: track.risk_level,
                    proximity_bucket: track.proximity_bucket,
                });
            }

            if track.announced
                && track.risk_level != prev_risk
                && cooldown_elapsed(
                    track.last_reclassified_at,
                    tick_id,
                    self.config.delta_cooldown_ticks,
                )
            {
                track.last_reclassified_at = Some(tick_id);
                deltas.push(SaliencyDelta::Reclassified {
                    track_id: *track_id,
                    class_label: track.class_label.clone(),
                    risk_level: track.risk_level,
                    proximity_bucket: track.proximity_bucket,
                    prev_risk,
                });
            }

            if track.ticks_since_observed >= self.config.evict_after_ticks {
                evicted.push(*track_id);
            }
        }

        for track_id in evicted {
            self.remove_track(&track_id);
            tracing::debug!(
                target: COMPONENT,
                track_id = %track_id.short_hex(),
                "evicted stale track"
            );
        }

        deltas
    }

    // -- association ------------------------------------------------------

    fn associate(&self, item: &EvidenceItem) -> Option<TrackId> {
        if let Some(track_id) = self.entity_index.get(&item.entity_id) {
            if self.tracks.contains_key(track_id) {
                return Some(*track_id);
            }
        }

        let class_code = class_enum_code(&item.class_label);
        let mut best: Option<(u64, TrackId)> = None;
        for (track_id, track) in &self.tracks {
            if track.class_enum != class_code || track.visibility.is_lost() {
                continue;
            }
            let distance = track.position.manhattan_distance(&item.position);
            if distance > self.config.association_radius {
                continue;
            }
            // Strict < keeps the smallest track id on distance ties, since
            // iteration is already in id order.
            if best.map_or(true, |(best_distance, _)| distance < best_distance) {
                best = Some((distance, *track_id));
            }
        }
        best.map(|(_, track_id)| track_id)
    }

    fn update_track(
        &mut self,
        track_id: TrackId,
        item: &EvidenceItem,
        tick_id: u64,
        deltas: &mut Vec<SaliencyDelta>,
    ) {
        let config = self.config.clone();
        let track = self.tracks.get_mut(&track_id).expect("associated track exists");

        let prev_risk = track.risk_level;
        let prev_proximity = track.proximity_bucket;
        let prev_entity_id = track.last_entity_id;

        track.position = item.position;
        track.proximity_bucket = item.proximity_bucket;
        track.visibility = match item.los {
            LineOfSight::Occluded => Visibility::Inferred,
            LineOfSight::Visible | LineOfSight::Unknown => Visibility::Visible,
        };
        track.confidence = grow_toward_one(track.confidence, config.confidence_boost.amount(item.los));
        track.p_unknown = track
            .p_unknown
            .saturating_sub(config.p_unknown_recovery.amount(item.los));
        track.risk_level = self.classifier.classify(
            &track.class_label,
            track.proximity_bucket,
            track.p_unknown,
        );
        track.last_seen_tick = tick_id;
        track.ticks_since_observed = 0;
        track.observation_count = track.observation_count.saturating_add(1);
        track.last_entity_id = item.entity_id;

        if !track.announced && track.observation_count >= config.warmup_observations {
            track.announced = true;
            deltas.push(SaliencyDelta::NewThreat {
                track_id,
                class_label: track.class_label.clone(),
                risk_level: track.risk_level,
                proximity_bucket: track.proximity_bucket,
                track: Some(track.summary()),
            });
        } else if track.announced {
            if track.risk_level != prev_risk
                && cooldown_elapsed(
                    track.last_reclassified_at,
                    tick_id,
                    config.delta_cooldown_ticks,
                )
            {
                track.last_reclassified_at = Some(tick_id);
                deltas.push(SaliencyDelta::Reclassified {
                    track_id,
                    class_label: track.class_label.clone(),
                    risk_level: track.risk_level,
                    proximity_bucket: track.proximity_bucket,
                    prev_risk,
                });
            }
            if track.proximity_bucket != prev_proximity
                && cooldown_elapsed(track.last_movement_at, tick_id, config.delta_cooldown_ticks)
            {
                track.last_movement_at = Some(tick_id);
                deltas.push(SaliencyDelta::MovementBucketChange {
                    track_id,
                    class_label: track.class_label.clone(),
                    risk_level: track.risk_level,
                    proximity_bucket: track.proximity_bucket,
                    prev_proximity_bucket: prev_proximity,
                });
            }
        }

        if prev_entity_id != item.entity_id {
            if self.entity_index.get(&prev_entity_id) == Some(&track_id) {
                self.entity_index.remove(&prev_entity_id);
            }
        }
        self.entity_index.insert(item.entity_id, track_id);
    }

    fn create_track(&mut self, item: &EvidenceItem, tick_id: u64, deltas: &mut Vec<SaliencyDelta>) {
        if self.tracks.len() >= self.config.track_cap {
            self.evict_capacity_victim();
        }
        if self.tracks.len() >= self.config.track_cap {
            // Capacity pressure is not an error; the observation is dropped.
            tracing::debug!(
                target: COMPONENT,
                entity_id = item.entity_id,
                class_label = %item.class_label,
                "track cap reached, dropping observation"
            );
            return;
        }

        let class_enum = class_enum_code(&item.class_label);
        let track_id = derive_track_id(tick_id, &item.position, class_enum, self.next_disambiguator);
        self.next_disambiguator += 1;

        let risk_level = self.classifier.classify(&item.class_label, item.proximity_bucket, 0);
        let mut track = Track {
            track_id,
            class_label: item.class_label.clone(),
            class_enum,
            position: item.position,
            proximity_bucket: item.proximity_bucket,
            confidence: self.config.initial_confidence,
            p_unknown: 0,
            visibility: match item.los {
                LineOfSight::Occluded => Visibility::Inferred,
                LineOfSight::Visible | LineOfSight::Unknown => Visibility::Visible,
            },
            risk_level,
            first_seen_tick: tick_id,
            last_seen_tick: tick_id,
            ticks_since_observed: 0,
            last_entity_id: item.entity_id,
            observation_count: 1,
            announced: false,
            last_reclassified_at: None,
            last_movement_at: None,
        };

        if track.observation_count >= self.config.warmup_observations {
            track.announced = true;
            deltas.push(SaliencyDelta::NewThreat {
                track_id,
                class_label: track.class_label.clone(),
                risk_level: track.risk_level,
                proximity_bucket: track.proximity_bucket,
                track: Some(track.summary()),
            });
        }

        self.entity_index.insert(item.entity_id, track_id);
        self.tracks.insert(track_id, track);
    }

    // -- eviction ---------------------------------------------------------

    /// Remove the lowest-scoring track to make room. Ties fall to the
    /// smallest track id because iteration is in id order and the
    /// comparison is strict.
    fn evict_capacity_victim(&mut self) {
        let mut victim: Option<(u128, TrackId)> = None;
        for (track_id, track) in &self.tracks {
            let score = eviction_score(track);
            if victim.map_or(true, |(best, _)| score < best) {
                victim = Some((score, *track_id));
            }
        }
        if let Some((_, track_id)) = victim {
            self.remove_track(&track_id);
            tracing::debug!(
                target: COMPONENT,
                track_id = %track_id.short_hex(),
                "evicted lowest-scoring track for capacity"
            );
        }
    }

    fn remove_track(&mut self, track_id: &TrackId) {
        if let Some(track) = self.tracks.remove(track_id) {
            if self.entity_index.get(&track.last_entity_id) == Some(track_id) {
                self.entity_index.remove(&track.last_entity_id);
            }
        }
    }
}

/// Retention score: confidence x (1 - p_unknown/2) x (risk rank + 1),
/// divided by staleness. Evaluated in u128 so independent implementations
/// agree bit-for-bit.
fn eviction_score(track: &Track) -> u128 {
    let confidence = u128::from(track.confidence);
    let certainty = u128::from(MILLIONTHS_ONE - track.p_unknown / 2);
    let risk_weight = u128::from(track.risk_level.rank()) + 1;
    confidence * certainty * risk_weight / (u128::from(track.ticks_since_observed) + 1)
}

fn grow_toward_one(value: u32, amount: u32) -> u32 {
    value.saturating_add(amount).min(MILLIONTHS_ONE)
}

fn decay_toward_floor(value: u32, amount: u32, floor: u32) -> u32 {
    value.saturating_sub(amount).max(floor)
}

fn cooldown_elapsed(last_fired: Option<u64>, now: u64, cooldown: u64) -> bool {
    match last_fired {
        None => true,
        Some(at) => now.saturating_sub(at) >= cooldown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::PositionBucket;
    use crate::risk::{OverworldRiskClassifier, PerimeterRiskClassifier};
    use crate::saliency_protocol::SaliencyDeltaKind;

    fn engine() -> TrackEngine {
        TrackEngine::new(
            TrackEngineConfig::default(),
            Box::new(PerimeterRiskClassifier),
        )
        .expect("valid config")
    }

    fn item(entity_id: u64, class_label: &str, position: PositionBucket) -> EvidenceItem {
        EvidenceItem {
            entity_id,
            class_label: class_label.to_string(),
            position,
            proximity_bucket: 3,
            los: LineOfSight::Visible,
            features: None,
        }
    }

    fn batch(tick_id: u64, items: Vec<EvidenceItem>) -> EvidenceBatch {
        EvidenceBatch::with_items(tick_id, items)
    }

    #[test]
    fn construction_fails_closed_on_undeclared_extension() {
        let config = TrackEngineConfig {
            want_detailed_risk: true,
            ..TrackEngineConfig::default()
        };
        let err = TrackEngine::new(config, Box::new(OverworldRiskClassifier))
            .err()
            .expect("must fail at construction");
        assert!(matches!(err, EngineError::DetailedRiskUnsupported));
        assert_eq!(error_code(&err), "LK_ENGINE_DETAILED_RISK_UNSUPPORTED");
    }

    #[test]
    fn detailed_risk_requires_declaration() {
        let engine = engine();
        let track_id = derive_track_id(1, &PositionBucket::new(0, 0, 0), 0, 0);
        let err = engine.detailed_risk(&track_id).expect_err("gated");
        assert!(matches!(err, EngineError::DetailedRiskNotDeclared));
    }

    #[test]
    fn config_ordering_relationships_are_enforced() {
        let config = TrackEngineConfig {
            lost_after_ticks: 40,
            ..TrackEngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));

        let config = TrackEngineConfig {
            confidence_boost: LosProfile {
                visible: 10,
                unknown: 10,
                occluded: 5,
            },
            ..TrackEngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn warmup_defers_announcement_to_second_observation() {
        let mut engine = engine();
        let position = PositionBucket::new(5, 64, 0);

        let deltas = engine.ingest(&batch(1, vec![item(42, "intruder", position)]));
        assert!(deltas.is_empty(), "no announcement on first observation");
        assert_eq!(engine.len(), 1);

        let deltas = engine.ingest(&batch(2, vec![item(42, "intruder", position)]));
        assert_eq!(deltas.len(), 1);
        match &deltas[0] {
            SaliencyDelta::NewThreat { track, .. } => {
                let summary = track.as_ref().expect("inline summary");
                assert_eq!(summary.first_seen_tick, 1);
                assert_eq!(summary.last_seen_tick, 2);
            }
            other => panic!("expected new_threat, got {other:?}"),
        }

        // Third observation must not announce again.
        let deltas = engine.ingest(&batch(3, vec![item(42, "intruder", position)]));
        assert!(deltas.iter().all(|d| d.kind() != SaliencyDeltaKind::NewThreat));
    }

    #[test]
    fn entity_id_churn_reassociates_by_position() {
        let mut engine = engine();
        let position = PositionBucket::new(5, 64, 0);

        engine.ingest(&batch(1, vec![item(42, "intruder", position)]));
        let original_id = engine.tracks().next().expect("track").track_id;

        // Same class, one bucket away, new producer entity id.
        let moved = item(99, "intruder", PositionBucket::new(6, 64, 0));
        engine.ingest(&batch(2, vec![moved]));

        assert_eq!(engine.len(), 1, "re-associated, not duplicated");
        assert_eq!(engine.tracks().next().expect("track").track_id, original_id);
        assert_eq!(engine.tracks().next().expect("track").last_entity_id, 99);
    }

    #[test]
    fn identity_ignores_feature_payloads() {
        let position = PositionBucket::new(5, 64, 0);
        let mut left = engine();
        let mut right = engine();

        let mut with_features = item(42, "intruder", position);
        with_features.features = Some(serde_json::json!({"embedding": [0.2, 0.9]}));

        left.ingest(&batch(1, vec![item(42, "intruder", position)]));
        right.ingest(&batch(1, vec![with_features]));

        assert_eq!(
            left.tracks().next().expect("track").track_id,
            right.tracks().next().expect("track").track_id,
        );
    }

    #[test]
    fn capacity_evicts_lowest_score_then_drops() {
        let config = TrackEngineConfig {
            track_cap: 2,
            ..TrackEngineConfig::default()
        };
        let mut engine =
            TrackEngine::new(config, Box::new(PerimeterRiskClassifier)).expect("valid");

        engine.ingest(&batch(
            1,
            vec![
                item(1, "intruder", PositionBucket::new(0, 0, 0)),
                item(2, "animal", PositionBucket::new(50, 0, 0)),
            ],
        ));
        assert_eq!(engine.len(), 2);

        // The animal has the lowest risk weight, so it is the victim.
        engine.ingest(&batch(2, vec![item(3, "drone", PositionBucket::new(100, 0, 0))]));
        assert_eq!(engine.len(), 2);
        let labels: Vec<&str> = engine.tracks().map(|t| t.class_label.as_str()).collect();
        assert!(labels.contains(&"intruder"));
        assert!(labels.contains(&"drone"));
        assert!(!labels.contains(&"animal"));
    }

    #[test]
    fn unobserved_tracks_decay_and_grow_uncertain() {
        let mut engine = engine();
        engine.ingest(&batch(1, vec![item(42, "intruder", PositionBucket::new(5, 64, 0))]));
        let track_id = engine.tracks().next().expect("track").track_id;
        let before = engine.get(&track_id).expect("track").clone();

        engine.tick(2);
        let after = engine.get(&track_id).expect("track");
        assert!(after.confidence < before.confidence);
        assert!(after.p_unknown > before.p_unknown);
        assert_eq!(after.ticks_since_observed, 1);
    }

    #[test]
    fn visibility_walks_visible_inferred_lost_with_one_lost_delta() {
        let mut engine = engine();
        engine.ingest(&batch(1, vec![item(42, "intruder", PositionBucket::new(5, 64, 0))]));
        let track_id = engine.tracks().next().expect("track").track_id;

        let mut lost_deltas = 0;
        for tick in 2..40 {
            let deltas = engine.tick(tick);
            lost_deltas += deltas
                .iter()
                .filter(|d| d.kind() == SaliencyDeltaKind::TrackLost)
                .count();
            if engine.get(&track_id).is_none() {
                break;
            }
        }
        assert_eq!(lost_deltas, 1, "track_lost fires exactly once");
        assert!(engine.get(&track_id).is_none(), "eventually evicted");
    }

    #[test]
    fn sustained_uncertainty_suppresses_risk() {
        let mut engine = engine();
        engine.ingest(&batch(
            1,
            vec![EvidenceItem {
                proximity_bucket: 0,
                ..item(42, "intruder", PositionBucket::new(1, 0, 0))
            }],
        ));
        let track_id = engine.tracks().next().expect("track").track_id;
        assert_eq!(
            engine.get(&track_id).expect("track").risk_level,
            RiskLevel::Critical
        );

        for tick in 2..30 {
            engine.tick(tick);
        }
        let suppressed = engine.get(&track_id).expect("still present");
        assert!(suppressed.risk_level <= RiskLevel::Moderate);
        assert_eq!(suppressed.p_unknown, MILLIONTHS_ONE);
    }

    #[test]
    fn eviction_score_prefers_stale_low_risk_tracks() {
        let fresh = Track {
            track_id: derive_track_id(1, &PositionBucket::new(0, 0, 0), 1, 0),
            class_label: "intruder".to_string(),
            class_enum: 1,
            position: PositionBucket::new(0, 0, 0),
            proximity_bucket: 1,
            confidence: 800_000,
            p_unknown: 0,
            visibility: Visibility::Visible,
            risk_level: RiskLevel::Critical,
            first_seen_tick: 1,
            last_seen_tick: 9,
            ticks_since_observed: 0,
            last_entity_id: 1,
            observation_count: 5,
            announced: true,
            last_reclassified_at: None,
            last_movement_at: None,
        };
        let stale = Track {
            risk_level: RiskLevel::Low,
            confidence: 100_000,
            p_unknown: 900_000,
            ticks_since_observed: 20,
            ..fresh.clone()
        };
        assert!(eviction_score(&stale) < eviction_score(&fresh));
    }

    #[test]
    fn cooldown_suppresses_repeated_deltas_of_one_kind() {
        assert!(cooldown_elapsed(None, 5, 10));
        assert!(!cooldown_elapsed(Some(5), 9, 10));
        assert!(cooldown_elapsed(Some(5), 15, 10));
    }
}
