//! Fixed catalog of cross-implementation invariants.
//!
//! Every guarantee the tracker makes is registered here as an
//! (invariant id, check) pair evaluated over a recorded scenario trace.
//! The trace is produced by driving a pluggable implementation-under-test
//! through a fixed script covering engine dynamics, the wire protocol, and
//! the consumer-side reducer, so alternate domains prove the same
//! guarantees by plugging in their own stack.
//!
//! Checks are pure functions over trace data; they never touch live state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::evidence::{EvidenceBatch, EvidenceItem, LineOfSight, PositionBucket};
use crate::risk::{
    MILLIONTHS_ONE, OverworldRiskClassifier, PerimeterRiskClassifier, RiskLevel,
};
use crate::saliency_protocol::{
    Envelope, EnvelopePublisher, SaliencyDelta, SaliencyDeltaKind, REQUEST_KIND, SCHEMA_VERSION,
};
use crate::stream_reducer::{ApplyOutcome, ReducerConfig, StreamReducer};
use crate::track::{TrackSummary, Visibility};
use crate::track_engine::{TrackEngine, TrackEngineConfig};
use crate::track_identity::{class_enum_code, derive_track_id, TrackId};

// ---------------------------------------------------------------------------
// DeterministicRng — seeded xorshift for scenario jitter
// ---------------------------------------------------------------------------

/// Seeded xorshift. Scenario jitter must be reproducible from the seed so
/// two implementations replay the identical script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    pub fn seeded(seed: u64) -> Self {
        let state = if seed == 0 {
            0x9E37_79B9_7F4A_7C15
        } else {
            seed
        };
        Self { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

// ---------------------------------------------------------------------------
// InvariantId
// ---------------------------------------------------------------------------

/// Stable identifiers for the catalog invariants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum InvariantId {
    BoundedTrackSet,
    UncertaintyMonotone,
    RiskSuppression,
    IdentityFeatureFree,
    NewThreatComplete,
    SingleAnnounce,
    OcclusionPersistence,
    LostTransitionDelta,
    SnapshotReplacesView,
    StaleDiscard,
    StreamSupersession,
}

impl InvariantId {
    pub const ALL: [InvariantId; 11] = [
        Self::BoundedTrackSet,
        Self::UncertaintyMonotone,
        Self::RiskSuppression,
        Self::IdentityFeatureFree,
        Self::NewThreatComplete,
        Self::SingleAnnounce,
        Self::OcclusionPersistence,
        Self::LostTransitionDelta,
        Self::SnapshotReplacesView,
        Self::StaleDiscard,
        Self::StreamSupersession,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BoundedTrackSet => "bounded-track-set",
            Self::UncertaintyMonotone => "uncertainty-monotone",
            Self::RiskSuppression => "risk-suppression",
            Self::IdentityFeatureFree => "identity-feature-free",
            Self::NewThreatComplete => "new-threat-complete",
            Self::SingleAnnounce => "single-announce",
            Self::OcclusionPersistence => "occlusion-persistence",
            Self::LostTransitionDelta => "lost-transition-delta",
            Self::SnapshotReplacesView => "snapshot-replaces-view",
            Self::StaleDiscard => "stale-discard",
            Self::StreamSupersession => "stream-supersession",
        }
    }
}

impl fmt::Display for InvariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SaliencyStack — implementation-under-test
// ---------------------------------------------------------------------------

/// Thresholds the scenario script needs from the implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackThresholds {
    pub track_cap: usize,
    pub warmup_observations: u32,
    pub lost_after_ticks: u64,
    pub evict_after_ticks: u64,
    /// Unobserved ticks after which risk must sit at or below the ceiling.
    pub suppression_horizon_ticks: u64,
    pub suppression_ceiling: RiskLevel,
}

/// Pluggable implementation-under-test: the producer-side tracker of any
/// conforming implementation.
pub trait SaliencyStack {
    fn domain(&self) -> &str;
    fn thresholds(&self) -> StackThresholds;
    fn ingest(&mut self, batch: &EvidenceBatch) -> Vec<SaliencyDelta>;
    fn tick(&mut self, tick_id: u64) -> Vec<SaliencyDelta>;
    /// Current track set, wire-projected, in deterministic order.
    fn view(&self) -> Vec<TrackSummary>;
    fn classify(&self, class_label: &str, proximity_bucket: u32, p_unknown: u32) -> RiskLevel;
}

/// Builds fresh stacks for a domain; the script needs several independent
/// instances (feature twins, occlusion replay, protocol run).
pub trait StackProvider {
    fn domain(&self) -> &str;
    /// Class labels the scenario script draws from.
    fn class_labels(&self) -> Vec<String>;
    fn fresh(&self) -> Box<dyn SaliencyStack>;
}

// ---------------------------------------------------------------------------
// ReferenceStackProvider — this crate's engine, both domains
// ---------------------------------------------------------------------------

/// Reference domains shipped with this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceDomain {
    Perimeter,
    Overworld,
}

/// Provider backed by `TrackEngine` with a compact conformance config.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceStackProvider {
    domain: ReferenceDomain,
}

impl ReferenceStackProvider {
    pub fn perimeter() -> Self {
        Self {
            domain: ReferenceDomain::Perimeter,
        }
    }

    pub fn overworld() -> Self {
        Self {
            domain: ReferenceDomain::Overworld,
        }
    }

    fn config() -> TrackEngineConfig {
        // Compact cap keeps traces small; every ordering relationship of the
        // production defaults is preserved.
        TrackEngineConfig {
            track_cap: 8,
            ..TrackEngineConfig::default()
        }
    }
}

impl StackProvider for ReferenceStackProvider {
    fn domain(&self) -> &str {
        match self.domain {
            ReferenceDomain::Perimeter => "perimeter",
            ReferenceDomain::Overworld => "overworld",
        }
    }

    fn class_labels(&self) -> Vec<String> {
        let labels: &[&str] = match self.domain {
            ReferenceDomain::Perimeter => &["intruder", "drone", "vehicle", "animal"],
            ReferenceDomain::Overworld => &["creeper", "skeleton", "zombie", "spider", "villager"],
        };
        labels.iter().map(ToString::to_string).collect()
    }

    fn fresh(&self) -> Box<dyn SaliencyStack> {
        let engine = match self.domain {
            ReferenceDomain::Perimeter => {
                TrackEngine::new(Self::config(), Box::new(PerimeterRiskClassifier))
            }
            ReferenceDomain::Overworld => {
                TrackEngine::new(Self::config(), Box::new(OverworldRiskClassifier))
            }
        }
        .expect("reference config is valid");
        Box::new(ReferenceStack {
            domain: self.domain().to_string(),
            engine,
        })
    }
}

struct ReferenceStack {
    domain: String,
    engine: TrackEngine,
}

impl SaliencyStack for ReferenceStack {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn thresholds(&self) -> StackThresholds {
        let config = self.engine.config();
        StackThresholds {
            track_cap: config.track_cap,
            warmup_observations: config.warmup_observations,
            lost_after_ticks: config.lost_after_ticks,
            evict_after_ticks: config.evict_after_ticks,
            // With default growth, uncertainty crosses the moderate cap
            // inside this horizon.
            suppression_horizon_ticks: 16,
            suppression_ceiling: RiskLevel::Moderate,
        }
    }

    fn ingest(&mut self, batch: &EvidenceBatch) -> Vec<SaliencyDelta> {
        self.engine.ingest(batch)
    }

    fn tick(&mut self, tick_id: u64) -> Vec<SaliencyDelta> {
        self.engine.tick(tick_id)
    }

    fn view(&self) -> Vec<TrackSummary> {
        self.engine.summaries()
    }

    fn classify(&self, class_label: &str, proximity_bucket: u32, p_unknown: u32) -> RiskLevel {
        self.engine.classify(class_label, proximity_bucket, p_unknown)
    }
}

// ---------------------------------------------------------------------------
// Trace records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOp {
    Ingest { items: usize },
    Tick,
}

/// One engine operation and the state it left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub tick_id: u64,
    pub op: TraceOp,
    pub deltas: Vec<SaliencyDelta>,
    pub view: Vec<TrackSummary>,
    pub track_cap: usize,
}

/// One classifier evaluation, for the monotonicity sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSweepRow {
    pub class_label: String,
    pub proximity_bucket: u32,
    pub p_unknown: u32,
    pub level: RiskLevel,
}

/// Risk observed on a track unobserved past the suppression horizon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionRow {
    pub track_id: TrackId,
    pub ticks_unobserved: u64,
    pub level: RiskLevel,
}

/// Track ids from two runs whose evidence differs only in feature payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTwinSection {
    pub run_a: Vec<TrackId>,
    pub run_b: Vec<TrackId>,
}

/// Track id before and after a sub-threshold occlusion gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcclusionSection {
    pub pre: Option<TrackId>,
    pub post: Option<TrackId>,
}

/// Mirrored ids around a snapshot application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMergeCheck {
    pub pre_ids: Vec<TrackId>,
    pub snapshot_ids: Vec<TrackId>,
    pub post_ids: Vec<TrackId>,
}

/// Observations from driving the reducer over a scripted envelope flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerSection {
    /// Outcome tag for a replayed duplicate envelope.
    pub stale_outcome: String,
    /// Outcome tag for a late envelope from a superseded stream.
    pub superseded_outcome: String,
    /// Mirrored ids after the restart stream's first snapshot.
    pub view_after_restart: Vec<TrackId>,
    /// Ids carried by that snapshot.
    pub restart_snapshot_ids: Vec<TrackId>,
    pub snapshot_merge: SnapshotMergeCheck,
    /// Whether a summary-less new_threat put a track into the view.
    pub fabricated_from_naked_new_threat: bool,
}

/// Everything the catalog checks run against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformanceTrace {
    pub domain: String,
    pub seed: u64,
    pub suppression_ceiling: RiskLevel,
    pub steps: Vec<TraceStep>,
    pub risk_sweep: Vec<RiskSweepRow>,
    pub suppression: Vec<SuppressionRow>,
    pub feature_twins: FeatureTwinSection,
    pub occlusion: OcclusionSection,
    pub reducer: ReducerSection,
}

// ---------------------------------------------------------------------------
// Scenario script
// ---------------------------------------------------------------------------

fn evidence(
    entity_id: u64,
    class_label: &str,
    position: PositionBucket,
    proximity_bucket: u32,
    los: LineOfSight,
) -> EvidenceItem {
    EvidenceItem {
        entity_id,
        class_label: class_label.to_string(),
        position,
        proximity_bucket,
        los,
        features: None,
    }
}

fn record(steps: &mut Vec<TraceStep>, stack: &dyn SaliencyStack, tick_id: u64, op: TraceOp, deltas: Vec<SaliencyDelta>) {
    steps.push(TraceStep {
        tick_id,
        op,
        deltas,
        view: stack.view(),
        track_cap: stack.thresholds().track_cap,
    });
}

fn sorted_view_ids(stack: &dyn SaliencyStack) -> Vec<TrackId> {
    let mut ids: Vec<TrackId> = stack.view().iter().map(|t| t.track_id).collect();
    ids.sort();
    ids
}

fn sorted_summary_ids(tracks: &[TrackSummary]) -> Vec<TrackId> {
    let mut ids: Vec<TrackId> = tracks.iter().map(|t| t.track_id).collect();
    ids.sort();
    ids
}

fn outcome_tag(outcome: &ApplyOutcome) -> String {
    match outcome {
        ApplyOutcome::Applied { .. } => "applied".to_string(),
        ApplyOutcome::Discarded { reason } => reason.as_str().to_string(),
    }
}

/// Drive the implementation through the fixed conformance script and record
/// everything the catalog checks need.
pub fn build_trace(provider: &dyn StackProvider, seed: u64) -> ConformanceTrace {
    let mut rng = DeterministicRng::seeded(seed);
    let labels = provider.class_labels();
    let jitter = (rng.next_u64() % 17) as i32;

    // -- main run: steady observation, occlusion, capacity burst, silence --
    let mut stack = provider.fresh();
    let thresholds = stack.thresholds();
    let mut steps = Vec::new();

    let base_x = 10 + jitter;
    let mut tick_id = 1u64;

    // Steady observation of three entities.
    while tick_id <= 6 {
        let mut batch = EvidenceBatch::new(tick_id);
        for (slot, label) in labels.iter().take(3).enumerate() {
            let slot_i32 = i32::try_from(slot).expect("small slot");
            let drift = i32::try_from(tick_id).expect("small tick");
            batch.push(evidence(
                40 + slot as u64,
                label,
                PositionBucket::new(base_x + 20 * slot_i32 + drift, 64, 0),
                2 + slot as u32,
                LineOfSight::Visible,
            ));
        }
        let deltas = stack.ingest(&batch);
        record(&mut steps, &*stack, tick_id, TraceOp::Ingest { items: batch.len() }, deltas);
        let deltas = stack.tick(tick_id);
        record(&mut steps, &*stack, tick_id, TraceOp::Tick, deltas);
        tick_id += 1;
    }

    // One entity goes occluded, the others stay visible.
    while tick_id <= 10 {
        let mut batch = EvidenceBatch::new(tick_id);
        let drift = i32::try_from(tick_id).expect("small tick");
        batch.push(evidence(
            40,
            &labels[0],
            PositionBucket::new(base_x + drift, 64, 0),
            2,
            LineOfSight::Occluded,
        ));
        batch.push(evidence(
            41,
            &labels[1],
            PositionBucket::new(base_x + 20 + drift, 64, 0),
            3,
            LineOfSight::Visible,
        ));
        let deltas = stack.ingest(&batch);
        record(&mut steps, &*stack, tick_id, TraceOp::Ingest { items: batch.len() }, deltas);
        let deltas = stack.tick(tick_id);
        record(&mut steps, &*stack, tick_id, TraceOp::Tick, deltas);
        tick_id += 1;
    }

    // Capacity burst: more distinct entities than the cap admits.
    {
        let mut batch = EvidenceBatch::new(tick_id);
        let burst = thresholds.track_cap + 4;
        for i in 0..burst {
            let label = &labels[i % labels.len()];
            let i_i32 = i32::try_from(i).expect("small burst index");
            batch.push(evidence(
                200 + i as u64,
                label,
                PositionBucket::new(1_000 + 50 * i_i32, 64, 0),
                4,
                LineOfSight::Visible,
            ));
        }
        let deltas = stack.ingest(&batch);
        record(&mut steps, &*stack, tick_id, TraceOp::Ingest { items: batch.len() }, deltas);
        let deltas = stack.tick(tick_id);
        record(&mut steps, &*stack, tick_id, TraceOp::Tick, deltas);
        tick_id += 1;
    }

    // Silence: everything decays through inferred and lost.
    let quiet_until = tick_id + thresholds.suppression_horizon_ticks.max(thresholds.lost_after_ticks) + 2;
    while tick_id < quiet_until {
        let deltas = stack.tick(tick_id);
        record(&mut steps, &*stack, tick_id, TraceOp::Tick, deltas);
        tick_id += 1;
    }

    // Suppression rows: tracks unobserved past the horizon must sit at or
    // below the ceiling.
    let final_tick = tick_id - 1;
    let suppression: Vec<SuppressionRow> = stack
        .view()
        .iter()
        .filter_map(|t| {
            let unobserved = final_tick.saturating_sub(t.last_seen_tick);
            (unobserved >= thresholds.suppression_horizon_ticks).then(|| SuppressionRow {
                track_id: t.track_id,
                ticks_unobserved: unobserved,
                level: t.risk_level,
            })
        })
        .collect();

    // -- classifier sweep --------------------------------------------------
    let mut risk_sweep = Vec::new();
    for label in &labels {
        for proximity_bucket in [0u32, 3, 7] {
            let mut p_unknown = 0u32;
            loop {
                risk_sweep.push(RiskSweepRow {
                    class_label: label.clone(),
                    proximity_bucket,
                    p_unknown,
                    level: stack.classify(label, proximity_bucket, p_unknown),
                });
                if p_unknown >= MILLIONTHS_ONE {
                    break;
                }
                p_unknown = (p_unknown + 100_000).min(MILLIONTHS_ONE);
            }
        }
    }

    // -- feature twins -----------------------------------------------------
    let feature_twins = {
        let run = |features: Option<serde_json::Value>| {
            let mut twin = provider.fresh();
            for twin_tick in 1..=2u64 {
                let mut item = evidence(
                    7,
                    &labels[0],
                    PositionBucket::new(base_x, 70, -4),
                    2,
                    LineOfSight::Visible,
                );
                item.features = features.clone();
                twin.ingest(&EvidenceBatch::with_items(twin_tick, vec![item]));
                twin.tick(twin_tick);
            }
            sorted_view_ids(&*twin)
        };
        FeatureTwinSection {
            run_a: run(None),
            run_b: run(Some(serde_json::json!({
                "embedding": [0.125, 0.5, 0.875],
                "heat": 3,
            }))),
        }
    };

    // -- occlusion persistence ---------------------------------------------
    let occlusion = {
        let mut replay = provider.fresh();
        let gap = thresholds.lost_after_ticks - 2;
        let position = PositionBucket::new(base_x + 3, 65, 2);
        for replay_tick in 1..=2u64 {
            replay.ingest(&EvidenceBatch::with_items(
                replay_tick,
                vec![evidence(21, &labels[0], position, 2, LineOfSight::Visible)],
            ));
            replay.tick(replay_tick);
        }
        let pre = sorted_view_ids(&*replay).first().copied();
        let mut replay_tick = 3u64;
        while replay_tick < 3 + gap {
            replay.tick(replay_tick);
            replay_tick += 1;
        }
        // Re-observation under a fresh producer entity id forces spatial
        // association.
        replay.ingest(&EvidenceBatch::with_items(
            replay_tick,
            vec![evidence(77, &labels[0], position, 2, LineOfSight::Visible)],
        ));
        replay.tick(replay_tick);
        let post = sorted_view_ids(&*replay).first().copied();
        OcclusionSection { pre, post }
    };

    // -- protocol + reducer run --------------------------------------------
    let reducer = build_reducer_section(provider, seed);

    ConformanceTrace {
        domain: provider.domain().to_string(),
        seed,
        suppression_ceiling: thresholds.suppression_ceiling,
        steps,
        risk_sweep,
        suppression,
        feature_twins,
        occlusion,
        reducer,
    }
}

fn conformance_summary(label: &str, disambiguator: u64, risk_level: RiskLevel) -> TrackSummary {
    let position = PositionBucket::new(4, 64, 4);
    let class_enum = class_enum_code(label);
    TrackSummary {
        track_id: derive_track_id(1, &position, class_enum, disambiguator),
        class_label: label.to_string(),
        class_enum,
        pos_bucket_x: position.x,
        pos_bucket_y: position.y,
        pos_bucket_z: position.z,
        proximity_bucket: 3,
        visibility: Visibility::Visible,
        risk_level,
        confidence: 600_000,
        p_unknown: 0,
        first_seen_tick: 1,
        last_seen_tick: 1,
    }
}

fn build_reducer_section(provider: &dyn StackProvider, seed: u64) -> ReducerSection {
    let labels = provider.class_labels();
    let bot_id = "conformance-bot";
    let mut reducer = StreamReducer::new(ReducerConfig::default()).expect("valid config");

    // Stream A: every envelope snapshots, fabricated summaries keep the
    // merge check disjoint.
    let mut publisher_a = EnvelopePublisher::new(bot_id, seed, 1);
    let first = vec![
        conformance_summary(&labels[0], 0, RiskLevel::High),
        conformance_summary(&labels[1 % labels.len()], 1, RiskLevel::Moderate),
    ];
    let replacement = vec![conformance_summary(&labels[2 % labels.len()], 2, RiskLevel::Low)];

    let env_a0 = publisher_a.publish(1, Vec::new(), || first.clone());
    reducer.apply(&env_a0).expect("apply a0");
    let pre_ids = sorted_summary_ids(&reducer.view(bot_id));

    let env_a1 = publisher_a.publish(2, Vec::new(), || replacement.clone());
    let snapshot_ids = env_a1
        .snapshot
        .as_ref()
        .map(|s| sorted_summary_ids(&s.tracks))
        .unwrap_or_default();
    reducer.apply(&env_a1).expect("apply a1");
    let post_ids = sorted_summary_ids(&reducer.view(bot_id));
    let snapshot_merge = SnapshotMergeCheck {
        pre_ids,
        snapshot_ids,
        post_ids,
    };

    // Duplicate of a1 must be discarded as stale.
    let stale_outcome = outcome_tag(&reducer.apply(&env_a1).expect("replay a1"));

    // A late envelope from stream A, created before the restart below.
    let env_a2 = publisher_a.publish(3, Vec::new(), Vec::new);

    // Restart: stream B supersedes A.
    let mut publisher_b = EnvelopePublisher::new(bot_id, seed.wrapping_add(1), 1);
    let restart_tracks = vec![conformance_summary(&labels[0], 9, RiskLevel::High)];
    let env_b0 = publisher_b.publish(5, Vec::new(), || restart_tracks.clone());
    let restart_snapshot_ids = env_b0
        .snapshot
        .as_ref()
        .map(|s| sorted_summary_ids(&s.tracks))
        .unwrap_or_default();
    reducer.apply(&env_b0).expect("apply b0");

    let superseded_outcome = outcome_tag(&reducer.apply(&env_a2).expect("late a2"));
    let view_after_restart = sorted_summary_ids(&reducer.view(bot_id));

    // A summary-less new_threat must not fabricate a track.
    let phantom = conformance_summary(&labels[0], 33, RiskLevel::Critical);
    let naked = Envelope {
        schema_version: SCHEMA_VERSION.to_string(),
        request_kind: REQUEST_KIND.to_string(),
        bot_id: bot_id.to_string(),
        stream_id: publisher_b.stream_id().to_string(),
        seq: 1,
        tick_id: 6,
        snapshot: None,
        saliency_events: vec![SaliencyDelta::NewThreat {
            track_id: phantom.track_id,
            class_label: phantom.class_label.clone(),
            risk_level: phantom.risk_level,
            proximity_bucket: phantom.proximity_bucket,
            track: None,
        }],
    };
    reducer.apply(&naked).expect("apply naked");
    let fabricated_from_naked_new_threat = reducer
        .view(bot_id)
        .iter()
        .any(|t| t.track_id == phantom.track_id);

    ReducerSection {
        stale_outcome,
        superseded_outcome,
        view_after_restart,
        restart_snapshot_ids,
        snapshot_merge,
        fabricated_from_naked_new_threat,
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A violated invariant with context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: InvariantId,
    pub detail: String,
}

/// One registered invariant check.
pub struct InvariantCheck {
    pub id: InvariantId,
    pub check: fn(&ConformanceTrace) -> Result<(), String>,
}

/// The fixed invariant registry.
pub fn catalog() -> Vec<InvariantCheck> {
    vec![
        InvariantCheck {
            id: InvariantId::BoundedTrackSet,
            check: check_bounded_track_set,
        },
        InvariantCheck {
            id: InvariantId::UncertaintyMonotone,
            check: check_uncertainty_monotone,
        },
        InvariantCheck {
            id: InvariantId::RiskSuppression,
            check: check_risk_suppression,
        },
        InvariantCheck {
            id: InvariantId::IdentityFeatureFree,
            check: check_identity_feature_free,
        },
        InvariantCheck {
            id: InvariantId::NewThreatComplete,
            check: check_new_threat_complete,
        },
        InvariantCheck {
            id: InvariantId::SingleAnnounce,
            check: check_single_announce,
        },
        InvariantCheck {
            id: InvariantId::OcclusionPersistence,
            check: check_occlusion_persistence,
        },
        InvariantCheck {
            id: InvariantId::LostTransitionDelta,
            check: check_lost_transition_delta,
        },
        InvariantCheck {
            id: InvariantId::SnapshotReplacesView,
            check: check_snapshot_replaces_view,
        },
        InvariantCheck {
            id: InvariantId::StaleDiscard,
            check: check_stale_discard,
        },
        InvariantCheck {
            id: InvariantId::StreamSupersession,
            check: check_stream_supersession,
        },
    ]
}

/// Evaluate every catalog invariant; an empty result is a clean pass.
pub fn run_catalog(trace: &ConformanceTrace) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for entry in catalog() {
        if let Err(detail) = (entry.check)(trace) {
            violations.push(InvariantViolation {
                invariant: entry.id,
                detail,
            });
        }
    }
    violations
}

// -- checks ----------------------------------------------------------------

fn check_bounded_track_set(trace: &ConformanceTrace) -> Result<(), String> {
    for (index, step) in trace.steps.iter().enumerate() {
        if step.view.len() > step.track_cap {
            return Err(format!(
                "step {index} (tick {}) holds {} tracks over cap {}",
                step.tick_id,
                step.view.len(),
                step.track_cap
            ));
        }
    }
    Ok(())
}

fn check_uncertainty_monotone(trace: &ConformanceTrace) -> Result<(), String> {
    for pair in trace.steps.windows(2) {
        let (prev, step) = (&pair[0], &pair[1]);
        if step.op != TraceOp::Tick {
            continue;
        }
        let before: BTreeMap<TrackId, &TrackSummary> =
            prev.view.iter().map(|t| (t.track_id, t)).collect();
        for track in &step.view {
            let Some(was) = before.get(&track.track_id) else {
                continue;
            };
            // Only tracks that stayed unobserved across the pair.
            if track.last_seen_tick == step.tick_id || was.last_seen_tick != track.last_seen_tick {
                continue;
            }
            if track.p_unknown < was.p_unknown {
                return Err(format!(
                    "{} p_unknown fell {} -> {} across tick {}",
                    track.track_id,
                    was.p_unknown,
                    track.p_unknown,
                    step.tick_id
                ));
            }
        }
    }
    Ok(())
}

fn check_risk_suppression(trace: &ConformanceTrace) -> Result<(), String> {
    let mut last: BTreeMap<(&str, u32), (u32, RiskLevel)> = BTreeMap::new();
    for row in &trace.risk_sweep {
        let key = (row.class_label.as_str(), row.proximity_bucket);
        if let Some((prev_p, prev_level)) = last.get(&key) {
            if row.p_unknown >= *prev_p && row.level > *prev_level {
                return Err(format!(
                    "{}@{} risk rose {} -> {} as p_unknown grew {} -> {}",
                    row.class_label,
                    row.proximity_bucket,
                    prev_level,
                    row.level,
                    prev_p,
                    row.p_unknown
                ));
            }
        }
        last.insert(key, (row.p_unknown, row.level));
    }

    if trace.suppression.is_empty() {
        return Err("scenario produced no suppression samples".to_string());
    }
    for row in &trace.suppression {
        if row.level > trace.suppression_ceiling {
            return Err(format!(
                "{} unobserved {} ticks still at {} (ceiling {})",
                row.track_id, row.ticks_unobserved, row.level, trace.suppression_ceiling
            ));
        }
    }
    Ok(())
}

fn check_identity_feature_free(trace: &ConformanceTrace) -> Result<(), String> {
    if trace.feature_twins.run_a != trace.feature_twins.run_b {
        return Err(format!(
            "feature payloads leaked into identity: {:?} vs {:?}",
            trace.feature_twins.run_a, trace.feature_twins.run_b
        ));
    }
    Ok(())
}

fn check_new_threat_complete(trace: &ConformanceTrace) -> Result<(), String> {
    for step in &trace.steps {
        for delta in &step.deltas {
            if let SaliencyDelta::NewThreat { track_id, track, .. } = delta {
                if track.is_none() {
                    return Err(format!(
                        "new_threat for {track_id} at tick {} has no inline summary",
                        step.tick_id
                    ));
                }
            }
        }
    }
    if trace.reducer.fabricated_from_naked_new_threat {
        return Err("reducer fabricated a track from a summary-less new_threat".to_string());
    }
    Ok(())
}

fn check_single_announce(trace: &ConformanceTrace) -> Result<(), String> {
    let mut announced: BTreeSet<TrackId> = BTreeSet::new();
    for step in &trace.steps {
        for delta in &step.deltas {
            if delta.kind() == SaliencyDeltaKind::NewThreat {
                if !announced.insert(delta.track_id()) {
                    return Err(format!(
                        "{} announced more than once (tick {})",
                        delta.track_id(),
                        step.tick_id
                    ));
                }
            }
        }
    }
    Ok(())
}

fn check_occlusion_persistence(trace: &ConformanceTrace) -> Result<(), String> {
    match (trace.occlusion.pre, trace.occlusion.post) {
        (Some(pre), Some(post)) if pre == post => Ok(()),
        (Some(pre), Some(post)) => Err(format!(
            "identity changed across occlusion: {pre} -> {post}"
        )),
        _ => Err("occlusion scenario lost its track entirely".to_string()),
    }
}

fn check_lost_transition_delta(trace: &ConformanceTrace) -> Result<(), String> {
    for (index, pair) in trace.steps.windows(2).enumerate() {
        let (prev, step) = (&pair[0], &pair[1]);
        let before: BTreeMap<TrackId, Visibility> =
            prev.view.iter().map(|t| (t.track_id, t.visibility)).collect();

        let mut transitions: BTreeSet<TrackId> = BTreeSet::new();
        for track in &step.view {
            if track.visibility.is_lost()
                && before
                    .get(&track.track_id)
                    .is_some_and(|v| !v.is_lost())
            {
                transitions.insert(track.track_id);
            }
        }

        let mut announced_lost: BTreeSet<TrackId> = BTreeSet::new();
        for delta in &step.deltas {
            if delta.kind() == SaliencyDeltaKind::TrackLost {
                announced_lost.insert(delta.track_id());
            }
        }

        for track_id in transitions.difference(&announced_lost) {
            return Err(format!(
                "step {} (tick {}): {track_id} went lost without a track_lost delta",
                index + 1,
                step.tick_id
            ));
        }
        for track_id in announced_lost.difference(&transitions) {
            return Err(format!(
                "step {} (tick {}): track_lost for {track_id} without a lost transition",
                index + 1,
                step.tick_id
            ));
        }
    }
    Ok(())
}

fn check_snapshot_replaces_view(trace: &ConformanceTrace) -> Result<(), String> {
    let merge = &trace.reducer.snapshot_merge;
    if merge.post_ids != merge.snapshot_ids {
        return Err(format!(
            "snapshot was merged, not replaced: view {:?} vs snapshot {:?}",
            merge.post_ids, merge.snapshot_ids
        ));
    }
    Ok(())
}

fn check_stale_discard(trace: &ConformanceTrace) -> Result<(), String> {
    if trace.reducer.stale_outcome != "stale" {
        return Err(format!(
            "duplicate envelope was `{}`, expected `stale`",
            trace.reducer.stale_outcome
        ));
    }
    Ok(())
}

fn check_stream_supersession(trace: &ConformanceTrace) -> Result<(), String> {
    if trace.reducer.superseded_outcome != "superseded" {
        return Err(format!(
            "late envelope from retired stream was `{}`, expected `superseded`",
            trace.reducer.superseded_outcome
        ));
    }
    if trace.reducer.view_after_restart != trace.reducer.restart_snapshot_ids {
        return Err(format!(
            "restart view {:?} does not match the restart snapshot {:?}",
            trace.reducer.view_after_restart, trace.reducer.restart_snapshot_ids
        ));
    }
    Ok(())
}
