//! Mutation-injection ("needle") runner for the conformance catalog.
//!
//! Each needle is a minimal state mutation constructed to violate exactly
//! one catalog invariant (plus an explicitly tolerated co-failure set, when
//! a mutation cannot avoid touching neighbouring records). The runner
//! proves the catalog has teeth: the baseline trace must pass clean, and
//! every needle's observed failure set must match its expected signature —
//! a missing failure means a blind invariant check, an extra failure means
//! an overreaching one.

use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::conformance_catalog::{
    build_trace, run_catalog, ConformanceTrace, InvariantId, InvariantViolation, StackProvider,
    TraceOp,
};
use crate::risk::RiskLevel;
use crate::saliency_protocol::{SaliencyDelta, SaliencyDeltaKind};
use crate::track_identity::TrackId;

// ---------------------------------------------------------------------------
// Needle registry
// ---------------------------------------------------------------------------

/// One named mutation with its expected failure signature.
pub struct Needle {
    pub name: &'static str,
    pub description: &'static str,
    /// Invariants that MUST fail after the mutation.
    pub expected: &'static [InvariantId],
    /// Invariants that MAY additionally fail without failing the needle.
    pub tolerated: &'static [InvariantId],
    pub mutate: fn(&mut ConformanceTrace),
}

/// The fixed needle registry. Every catalog invariant has at least one
/// needle targeting it.
pub fn needle_registry() -> Vec<Needle> {
    vec![
        Needle {
            name: "cap-overflow",
            description: "inject extra tracks into the fullest recorded view",
            expected: &[InvariantId::BoundedTrackSet],
            tolerated: &[],
            mutate: mutate_cap_overflow,
        },
        Needle {
            name: "uncertainty-reversal",
            description: "shrink an unobserved track's p_unknown across a tick",
            expected: &[InvariantId::UncertaintyMonotone],
            tolerated: &[],
            mutate: mutate_uncertainty_reversal,
        },
        Needle {
            name: "risk-inflation-under-uncertainty",
            description: "force a classifier sweep row to rise with p_unknown",
            expected: &[InvariantId::RiskSuppression],
            tolerated: &[],
            mutate: mutate_risk_inflation,
        },
        Needle {
            name: "suppression-ceiling-breach",
            description: "report critical risk on a long-unobserved track",
            expected: &[InvariantId::RiskSuppression],
            tolerated: &[],
            mutate: mutate_suppression_breach,
        },
        Needle {
            name: "feature-identity-leak",
            description: "let the feature payload perturb a derived track id",
            expected: &[InvariantId::IdentityFeatureFree],
            tolerated: &[],
            mutate: mutate_feature_identity_leak,
        },
        Needle {
            name: "naked-new-threat",
            description: "strip the inline summary from an announcement",
            expected: &[InvariantId::NewThreatComplete],
            tolerated: &[],
            mutate: mutate_naked_new_threat,
        },
        Needle {
            name: "double-announce",
            description: "replay an announcement for an already-announced track",
            expected: &[InvariantId::SingleAnnounce],
            tolerated: &[],
            mutate: mutate_double_announce,
        },
        Needle {
            name: "occlusion-identity-swap",
            description: "hand the re-observed track a fresh identity",
            expected: &[InvariantId::OcclusionPersistence],
            tolerated: &[],
            mutate: mutate_occlusion_identity_swap,
        },
        Needle {
            name: "silent-lost-transition",
            description: "drop the delta for a recorded lost transition",
            expected: &[InvariantId::LostTransitionDelta],
            tolerated: &[],
            mutate: mutate_silent_lost_transition,
        },
        Needle {
            name: "phantom-lost-delta",
            description: "announce track_lost for a track that never transitioned",
            expected: &[InvariantId::LostTransitionDelta],
            tolerated: &[],
            mutate: mutate_phantom_lost_delta,
        },
        Needle {
            name: "snapshot-merge-regression",
            description: "union the old view into a snapshot application",
            expected: &[InvariantId::SnapshotReplacesView],
            tolerated: &[],
            mutate: mutate_snapshot_merge,
        },
        Needle {
            name: "stale-acceptance",
            description: "apply a duplicate envelope instead of discarding it",
            expected: &[InvariantId::StaleDiscard],
            tolerated: &[],
            mutate: mutate_stale_acceptance,
        },
        Needle {
            name: "superseded-resurrection",
            description: "let a retired stream overwrite the restarted view",
            expected: &[InvariantId::StreamSupersession],
            tolerated: &[InvariantId::SnapshotReplacesView],
            mutate: mutate_superseded_resurrection,
        },
        Needle {
            name: "reducer-fabrication",
            description: "record a track fabricated from a bare announcement",
            expected: &[InvariantId::NewThreatComplete],
            tolerated: &[],
            mutate: mutate_reducer_fabrication,
        },
    ]
}

// -- mutations -------------------------------------------------------------

fn perturbed(id: TrackId) -> TrackId {
    let mut bytes = id.0;
    bytes[0] ^= 0xFF;
    TrackId(bytes)
}

fn mutate_cap_overflow(trace: &mut ConformanceTrace) {
    let Some(step) = trace.steps.iter_mut().max_by_key(|s| s.view.len()) else {
        return;
    };
    let Some(template) = step.view.first().cloned() else {
        return;
    };
    let mut filler = 0u8;
    while step.view.len() <= step.track_cap + 1 {
        let mut clone = template.clone();
        let mut bytes = clone.track_id.0;
        bytes[0] = bytes[0].wrapping_add(1).wrapping_add(filler);
        bytes[31] = 0xEE;
        clone.track_id = TrackId(bytes);
        step.view.push(clone);
        filler = filler.wrapping_add(1);
    }
}

fn mutate_uncertainty_reversal(trace: &mut ConformanceTrace) {
    for i in 1..trace.steps.len() {
        if trace.steps[i].op != TraceOp::Tick {
            continue;
        }
        let tick_id = trace.steps[i].tick_id;
        let prev: Vec<(TrackId, u64, u32)> = trace.steps[i - 1]
            .view
            .iter()
            .map(|t| (t.track_id, t.last_seen_tick, t.p_unknown))
            .collect();
        for track in trace.steps[i].view.iter_mut() {
            if track.last_seen_tick == tick_id {
                continue;
            }
            let Some((_, _, prev_p_unknown)) = prev
                .iter()
                .find(|(id, seen, _)| *id == track.track_id && *seen == track.last_seen_tick)
            else {
                continue;
            };
            if *prev_p_unknown > 0 {
                track.p_unknown = prev_p_unknown - 1;
                return;
            }
        }
    }
}

fn mutate_risk_inflation(trace: &mut ConformanceTrace) {
    for j in 1..trace.risk_sweep.len() {
        let same_group = trace.risk_sweep[j].class_label == trace.risk_sweep[j - 1].class_label
            && trace.risk_sweep[j].proximity_bucket == trace.risk_sweep[j - 1].proximity_bucket;
        if same_group && trace.risk_sweep[j - 1].level < RiskLevel::Critical {
            trace.risk_sweep[j].level = RiskLevel::Critical;
            return;
        }
    }
}

fn mutate_suppression_breach(trace: &mut ConformanceTrace) {
    if let Some(row) = trace.suppression.first_mut() {
        row.level = RiskLevel::Critical;
    }
}

fn mutate_feature_identity_leak(trace: &mut ConformanceTrace) {
    if let Some(first) = trace.feature_twins.run_b.first_mut() {
        *first = perturbed(*first);
    }
}

fn mutate_naked_new_threat(trace: &mut ConformanceTrace) {
    for step in &mut trace.steps {
        for delta in &mut step.deltas {
            if let SaliencyDelta::NewThreat { track, .. } = delta {
                *track = None;
                return;
            }
        }
    }
}

fn mutate_double_announce(trace: &mut ConformanceTrace) {
    let announcement = trace
        .steps
        .iter()
        .flat_map(|s| &s.deltas)
        .find(|d| d.kind() == SaliencyDeltaKind::NewThreat)
        .cloned();
    if let (Some(delta), Some(last)) = (announcement, trace.steps.last_mut()) {
        last.deltas.push(delta);
    }
}

fn mutate_occlusion_identity_swap(trace: &mut ConformanceTrace) {
    if let Some(post) = trace.occlusion.post.as_mut() {
        *post = perturbed(*post);
    }
}

fn mutate_silent_lost_transition(trace: &mut ConformanceTrace) {
    for step in &mut trace.steps {
        if let Some(position) = step
            .deltas
            .iter()
            .position(|d| d.kind() == SaliencyDeltaKind::TrackLost)
        {
            step.deltas.remove(position);
            return;
        }
    }
}

fn mutate_phantom_lost_delta(trace: &mut ConformanceTrace) {
    if trace.steps.len() < 2 {
        return;
    }
    trace.steps[1].deltas.push(SaliencyDelta::TrackLost {
        track_id: TrackId([0xAB; 32]),
        class_label: "phantom".to_string(),
        risk_level: RiskLevel::Low,
        proximity_bucket: 0,
    });
}

fn mutate_snapshot_merge(trace: &mut ConformanceTrace) {
    let merge = &mut trace.reducer.snapshot_merge;
    let mut union: Vec<TrackId> = merge
        .pre_ids
        .iter()
        .chain(merge.snapshot_ids.iter())
        .copied()
        .collect();
    union.sort();
    union.dedup();
    merge.post_ids = union;
}

fn mutate_stale_acceptance(trace: &mut ConformanceTrace) {
    trace.reducer.stale_outcome = "applied".to_string();
}

fn mutate_superseded_resurrection(trace: &mut ConformanceTrace) {
    trace.reducer.superseded_outcome = "applied".to_string();
    trace.reducer.view_after_restart = trace.reducer.snapshot_merge.pre_ids.clone();
}

fn mutate_reducer_fabrication(trace: &mut ConformanceTrace) {
    trace.reducer.fabricated_from_naked_new_threat = true;
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Result of one needle execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedleOutcome {
    pub needle: String,
    pub expected: BTreeSet<InvariantId>,
    pub tolerated: BTreeSet<InvariantId>,
    pub observed: BTreeSet<InvariantId>,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedleRunSummary {
    pub domain: String,
    pub seed: u64,
    pub total_needles: usize,
    pub passed: usize,
    pub failed: usize,
    pub baseline_clean: bool,
}

/// Full machine-readable report of one domain's needle run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedleRunReport {
    pub domain: String,
    pub seed: u64,
    pub baseline_violations: Vec<InvariantViolation>,
    pub outcomes: Vec<NeedleOutcome>,
    pub summary: NeedleRunSummary,
}

impl NeedleRunReport {
    /// CI gate: a dirty baseline or any needle mismatch fails the run.
    pub fn enforce_ci_gate(&self) -> Result<(), NeedleGateError> {
        if !self.summary.baseline_clean || self.summary.failed > 0 {
            Err(NeedleGateError {
                domain: self.domain.clone(),
                baseline_clean: self.summary.baseline_clean,
                failed: self.summary.failed,
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeedleGateError {
    pub domain: String,
    pub baseline_clean: bool,
    pub failed: usize,
}

impl fmt::Display for NeedleGateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "needle gate failed for `{}`: baseline_clean={}, mismatched_needles={}",
            self.domain, self.baseline_clean, self.failed
        )
    }
}

impl Error for NeedleGateError {}

/// Run every needle against a fresh baseline trace for the given domain.
pub fn run_needles(provider: &dyn StackProvider, seed: u64) -> NeedleRunReport {
    let baseline = build_trace(provider, seed);
    let baseline_violations = run_catalog(&baseline);
    let baseline_clean = baseline_violations.is_empty();

    let registry = needle_registry();
    let mut outcomes = Vec::with_capacity(registry.len());
    let mut passed_count = 0;

    for needle in &registry {
        let mut mutated = baseline.clone();
        (needle.mutate)(&mut mutated);
        let observed: BTreeSet<InvariantId> = run_catalog(&mutated)
            .into_iter()
            .map(|v| v.invariant)
            .collect();
        let expected: BTreeSet<InvariantId> = needle.expected.iter().copied().collect();
        let tolerated: BTreeSet<InvariantId> = needle.tolerated.iter().copied().collect();

        let missing: Vec<InvariantId> = expected.difference(&observed).copied().collect();
        let unexpected: Vec<InvariantId> = observed
            .iter()
            .filter(|id| !expected.contains(*id) && !tolerated.contains(*id))
            .copied()
            .collect();
        let passed = missing.is_empty() && unexpected.is_empty();
        if passed {
            passed_count += 1;
        }

        let detail = if passed {
            "failure signature matched".to_string()
        } else {
            format!("missing failures {missing:?}, unexpected failures {unexpected:?}")
        };

        outcomes.push(NeedleOutcome {
            needle: needle.name.to_string(),
            expected,
            tolerated,
            observed,
            passed,
            detail,
        });
    }

    let total = outcomes.len();
    let failed = total - passed_count;
    NeedleRunReport {
        domain: provider.domain().to_string(),
        seed,
        baseline_violations,
        outcomes,
        summary: NeedleRunSummary {
            domain: provider.domain().to_string(),
            seed,
            total_needles: total,
            passed: passed_count,
            failed,
            baseline_clean,
        },
    }
}

/// Sha-256 fingerprint of a report's canonical JSON form.
pub fn report_digest(report: &NeedleRunReport) -> String {
    let bytes = serde_json::to_vec(report).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance_catalog::ReferenceStackProvider;

    #[test]
    fn registry_names_are_unique() {
        let registry = needle_registry();
        let names: BTreeSet<&str> = registry.iter().map(|n| n.name).collect();
        assert_eq!(names.len(), registry.len());
    }

    #[test]
    fn every_invariant_has_a_targeting_needle() {
        let targeted: BTreeSet<InvariantId> = needle_registry()
            .iter()
            .flat_map(|n| n.expected.iter().copied())
            .collect();
        for invariant in InvariantId::ALL {
            assert!(targeted.contains(&invariant), "{invariant} has no needle");
        }
    }

    #[test]
    fn reference_stacks_survive_the_full_needle_suite() {
        for provider in [
            ReferenceStackProvider::perimeter(),
            ReferenceStackProvider::overworld(),
        ] {
            let report = run_needles(&provider, 7);
            assert!(
                report.summary.baseline_clean,
                "{}: baseline violations {:?}",
                report.domain, report.baseline_violations
            );
            for outcome in &report.outcomes {
                assert!(
                    outcome.passed,
                    "{}: needle `{}` {}",
                    report.domain, outcome.needle, outcome.detail
                );
            }
            report.enforce_ci_gate().expect("gate passes");
        }
    }

    #[test]
    fn gate_rejects_mismatches() {
        let provider = ReferenceStackProvider::perimeter();
        let mut report = run_needles(&provider, 11);
        report.summary.failed = 1;
        let err = report.enforce_ci_gate().expect_err("gate must fail");
        assert_eq!(err.failed, 1);
        assert!(err.to_string().contains("perimeter"));
    }

    #[test]
    fn report_digest_is_stable_for_equal_reports() {
        let provider = ReferenceStackProvider::overworld();
        let a = run_needles(&provider, 3);
        let b = run_needles(&provider, 3);
        assert_eq!(report_digest(&a), report_digest(&b));
        let c = run_needles(&provider, 4);
        assert_ne!(report_digest(&a), report_digest(&c));
    }
}
