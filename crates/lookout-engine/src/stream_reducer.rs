//! Consumer-side reducer over the saliency envelope stream.
//!
//! Maintains a mirrored track view per bot under at-least-once, reorderable
//! delivery. Stream identity and sequence checks make application
//! idempotent against duplicates and safe against reordering: stale and
//! superseded envelopes are discarded with an observable reason, never
//! merged. Snapshots replace the whole view; deltas mutate it in order.
//!
//! Protocol violations fail closed: an unsupported schema version raises,
//! and a `new_threat` without its inline summary is logged and skipped —
//! the reducer never fabricates a track.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::risk::RiskLevel;
use crate::saliency_protocol::{
    self, Envelope, ProtocolError, SaliencyDelta, SCHEMA_VERSION,
};
use crate::track::{TrackSummary, Visibility};
use crate::track_identity::TrackId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const COMPONENT: &str = "stream_reducer";

const DEFAULT_SUPERSEDED_RING_CAP: usize = 4;
const DEFAULT_MAX_INSIGHT_ENTRIES: usize = 8;

/// Risk level at or above which a visible or inferred track demands a
/// response. The second-highest level of the scale.
pub const RESPONSE_RISK_FLOOR: RiskLevel = RiskLevel::High;

// ---------------------------------------------------------------------------
// ReducerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerConfig {
    /// How many retired stream ids to remember per bot.
    pub superseded_ring_cap: usize,
    /// Size cap on the synthesized priority summary.
    pub max_insight_entries: usize,
    /// Schema versions this consumer accepts. Fail closed on anything else.
    pub schema_whitelist: BTreeSet<String>,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            superseded_ring_cap: DEFAULT_SUPERSEDED_RING_CAP,
            max_insight_entries: DEFAULT_MAX_INSIGHT_ENTRIES,
            schema_whitelist: [SCHEMA_VERSION.to_string()].into_iter().collect(),
        }
    }
}

impl ReducerConfig {
    pub fn validate(&self) -> Result<(), ReducerError> {
        if self.superseded_ring_cap == 0 {
            return Err(ReducerError::InvalidConfig {
                reason: "superseded_ring_cap must be at least 1".to_string(),
            });
        }
        if self.max_insight_entries == 0 {
            return Err(ReducerError::InvalidConfig {
                reason: "max_insight_entries must be at least 1".to_string(),
            });
        }
        if self.schema_whitelist.is_empty() {
            return Err(ReducerError::InvalidConfig {
                reason: "schema_whitelist must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReducerError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ReducerError {
    #[error("invalid reducer config: {reason}")]
    InvalidConfig { reason: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Stable error code for structured logging and artifacts.
pub fn error_code(err: &ReducerError) -> &'static str {
    match err {
        ReducerError::InvalidConfig { .. } => "LK_REDUCER_INVALID_CONFIG",
        ReducerError::Protocol(inner) => saliency_protocol::error_code(inner),
    }
}

// ---------------------------------------------------------------------------
// ApplyOutcome / ReducerEvent
// ---------------------------------------------------------------------------

/// Why an envelope was discarded. Discards are expected under at-least-once
/// delivery and are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The envelope belongs to a stream already superseded by a restart.
    Superseded,
    /// Duplicate or out-of-order within the active stream.
    Stale,
}

impl DiscardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied {
        /// A restart was detected and the view was rebuilt for a new stream.
        started_stream: bool,
        snapshot_applied: bool,
        deltas_applied: usize,
        /// Protocol violations skipped-and-logged while applying.
        violations: usize,
    },
    Discarded {
        reason: DiscardReason,
    },
}

/// Structured event record for reducer observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerEvent {
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub bot_id: String,
    pub stream_id: String,
    pub seq: u64,
    pub tick_id: u64,
    pub error_code: Option<String>,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Insight
// ---------------------------------------------------------------------------

/// One prioritized entry of the synthesized picture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightEntry {
    pub track_id: TrackId,
    pub class_label: String,
    pub risk_level: RiskLevel,
    pub proximity_bucket: u32,
    pub visibility: Visibility,
}

/// Deterministic, priority-ordered summary of one bot's mirrored view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaliencyInsight {
    pub bot_id: String,
    pub entries: Vec<InsightEntry>,
    /// Non-lost tracks dropped by the size cap.
    pub truncated: usize,
    /// Any visible or inferred track at or above `RESPONSE_RISK_FLOOR`.
    pub should_respond: bool,
}

// ---------------------------------------------------------------------------
// BotStreamState / StreamReducer
// ---------------------------------------------------------------------------

/// Per-bot reducer state.
#[derive(Debug, Clone, Default)]
struct BotStreamState {
    active_stream: Option<String>,
    last_seq: Option<u64>,
    /// Retired stream ids, oldest first.
    superseded: VecDeque<String>,
    view: BTreeMap<TrackId, TrackSummary>,
    stale_discards: u64,
    superseded_discards: u64,
    violations: u64,
}

/// Synchronous reducer over envelopes for any number of bots. One instance
/// per consumer; callers serialize `apply` per bot stream.
#[derive(Debug, Default)]
pub struct StreamReducer {
    config: ReducerConfig,
    bots: BTreeMap<String, BotStreamState>,
    events: Vec<ReducerEvent>,
}

impl StreamReducer {
    pub fn new(config: ReducerConfig) -> Result<Self, ReducerError> {
        config.validate()?;
        Ok(Self {
            config,
            bots: BTreeMap::new(),
            events: Vec::new(),
        })
    }

    pub fn config(&self) -> &ReducerConfig {
        &self.config
    }

    /// Mirrored view for one bot, in track id order.
    pub fn view(&self, bot_id: &str) -> Vec<TrackSummary> {
        self.bots
            .get(bot_id)
            .map(|bot| bot.view.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Structured events recorded so far.
    pub fn events(&self) -> &[ReducerEvent] {
        &self.events
    }

    /// Drain recorded events.
    pub fn take_events(&mut self) -> Vec<ReducerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn discard_counts(&self, bot_id: &str) -> (u64, u64) {
        self.bots
            .get(bot_id)
            .map(|bot| (bot.stale_discards, bot.superseded_discards))
            .unwrap_or((0, 0))
    }

    /// Apply one envelope.
    ///
    /// Errors are protocol violations (unknown schema, wrong kind); ordering
    /// anomalies come back as `Discarded` outcomes.
    pub fn apply(&mut self, envelope: &Envelope) -> Result<ApplyOutcome, ReducerError> {
        let whitelist: Vec<&str> = self
            .config
            .schema_whitelist
            .iter()
            .map(String::as_str)
            .collect();
        envelope.validate(&whitelist)?;

        let ring_cap = self.config.superseded_ring_cap;
        let bot = self.bots.entry(envelope.bot_id.clone()).or_default();

        if bot.superseded.iter().any(|s| s == &envelope.stream_id) {
            bot.superseded_discards += 1;
            let event = discard_event(envelope, DiscardReason::Superseded);
            tracing::debug!(
                target: COMPONENT,
                bot_id = %envelope.bot_id,
                stream_id = %envelope.stream_id,
                seq = envelope.seq,
                "discarded envelope from superseded stream"
            );
            self.events.push(event);
            return Ok(ApplyOutcome::Discarded {
                reason: DiscardReason::Superseded,
            });
        }

        let mut started_stream = false;
        if bot.active_stream.as_deref() != Some(envelope.stream_id.as_str()) {
            // Restart: retire the old stream and start clean.
            if let Some(old) = bot.active_stream.take() {
                if bot.superseded.len() >= ring_cap {
                    bot.superseded.pop_front();
                }
                bot.superseded.push_back(old);
            }
            bot.active_stream = Some(envelope.stream_id.clone());
            bot.last_seq = None;
            bot.view.clear();
            started_stream = true;
            self.events.push(ReducerEvent {
                component: COMPONENT.to_string(),
                event: "stream_started".to_string(),
                outcome: "ok".to_string(),
                bot_id: envelope.bot_id.clone(),
                stream_id: envelope.stream_id.clone(),
                seq: envelope.seq,
                tick_id: envelope.tick_id,
                error_code: None,
                detail: "restart detected, view cleared".to_string(),
            });
        }

        let bot = self.bots.get_mut(&envelope.bot_id).expect("bot state exists");
        if let Some(last_seq) = bot.last_seq {
            if envelope.seq <= last_seq {
                bot.stale_discards += 1;
                let event = discard_event(envelope, DiscardReason::Stale);
                tracing::debug!(
                    target: COMPONENT,
                    bot_id = %envelope.bot_id,
                    seq = envelope.seq,
                    last_seq,
                    "discarded stale envelope"
                );
                self.events.push(event);
                return Ok(ApplyOutcome::Discarded {
                    reason: DiscardReason::Stale,
                });
            }
        }
        bot.last_seq = Some(envelope.seq);

        let mut snapshot_applied = false;
        if let Some(snapshot) = &envelope.snapshot {
            // Replace, never merge.
            bot.view.clear();
            for summary in &snapshot.tracks {
                bot.view.insert(summary.track_id, summary.clone());
            }
            snapshot_applied = true;
        }

        let mut deltas_applied = 0;
        let mut violations = 0;
        for delta in &envelope.saliency_events {
            match apply_delta(&mut bot.view, delta) {
                Ok(()) => deltas_applied += 1,
                Err(violation) => {
                    violations += 1;
                    bot.violations += 1;
                    tracing::warn!(
                        target: COMPONENT,
                        bot_id = %envelope.bot_id,
                        error = %violation,
                        "protocol violation skipped, awaiting next snapshot"
                    );
                    self.events.push(ReducerEvent {
                        component: COMPONENT.to_string(),
                        event: "delta_rejected".to_string(),
                        outcome: "violation".to_string(),
                        bot_id: envelope.bot_id.clone(),
                        stream_id: envelope.stream_id.clone(),
                        seq: envelope.seq,
                        tick_id: envelope.tick_id,
                        error_code: Some(saliency_protocol::error_code(&violation).to_string()),
                        detail: violation.to_string(),
                    });
                }
            }
        }

        Ok(ApplyOutcome::Applied {
            started_stream,
            snapshot_applied,
            deltas_applied,
            violations,
        })
    }

    /// Synthesize the deterministic priority picture for one bot.
    pub fn insight(&self, bot_id: &str) -> SaliencyInsight {
        let mut candidates: Vec<&TrackSummary> = self
            .bots
            .get(bot_id)
            .map(|bot| {
                bot.view
                    .values()
                    .filter(|t| !t.visibility.is_lost())
                    .collect()
            })
            .unwrap_or_default();

        candidates.sort_by(|a, b| {
            b.risk_level
                .cmp(&a.risk_level)
                .then(a.proximity_bucket.cmp(&b.proximity_bucket))
                .then(a.track_id.cmp(&b.track_id))
        });

        let should_respond = candidates.iter().any(|t| {
            matches!(t.visibility, Visibility::Visible | Visibility::Inferred)
                && t.risk_level >= RESPONSE_RISK_FLOOR
        });

        let truncated = candidates.len().saturating_sub(self.config.max_insight_entries);
        let entries = candidates
            .into_iter()
            .take(self.config.max_insight_entries)
            .map(|t| InsightEntry {
                track_id: t.track_id,
                class_label: t.class_label.clone(),
                risk_level: t.risk_level,
                proximity_bucket: t.proximity_bucket,
                visibility: t.visibility,
            })
            .collect();

        SaliencyInsight {
            bot_id: bot_id.to_string(),
            entries,
            truncated,
            should_respond,
        }
    }
}

fn apply_delta(
    view: &mut BTreeMap<TrackId, TrackSummary>,
    delta: &SaliencyDelta,
) -> Result<(), ProtocolError> {
    match delta {
        SaliencyDelta::NewThreat { track_id, track, .. } => match track {
            Some(summary) => {
                view.insert(summary.track_id, summary.clone());
                Ok(())
            }
            // Never fabricate a track from a bare announcement.
            None => Err(ProtocolError::MissingNewThreatSummary { track_id: *track_id }),
        },
        SaliencyDelta::TrackLost {
            track_id,
            risk_level,
            ..
        } => {
            if let Some(summary) = view.get_mut(track_id) {
                summary.visibility = Visibility::Lost;
                summary.risk_level = *risk_level;
            }
            Ok(())
        }
        SaliencyDelta::Reclassified {
            track_id,
            risk_level,
            proximity_bucket,
            ..
        } => {
            if let Some(summary) = view.get_mut(track_id) {
                summary.risk_level = *risk_level;
                summary.proximity_bucket = *proximity_bucket;
            }
            Ok(())
        }
        SaliencyDelta::MovementBucketChange {
            track_id,
            risk_level,
            proximity_bucket,
            ..
        } => {
            if let Some(summary) = view.get_mut(track_id) {
                summary.proximity_bucket = *proximity_bucket;
                summary.risk_level = *risk_level;
            }
            Ok(())
        }
    }
}

fn discard_event(envelope: &Envelope, reason: DiscardReason) -> ReducerEvent {
    ReducerEvent {
        component: COMPONENT.to_string(),
        event: "envelope_discarded".to_string(),
        outcome: reason.as_str().to_string(),
        bot_id: envelope.bot_id.clone(),
        stream_id: envelope.stream_id.clone(),
        seq: envelope.seq,
        tick_id: envelope.tick_id,
        error_code: None,
        detail: format!("envelope seq {} discarded as {reason}", envelope.seq),
    }
}
