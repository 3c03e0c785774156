#![forbid(unsafe_code)]
//! Integration tests for the conformance catalog and needle harness.
//!
//! The portability contract: both reference domains must pass the same
//! invariant catalog clean, and every registered needle must break exactly
//! its declared invariants in both domains.

use std::collections::BTreeSet;

use lookout_engine::conformance_catalog::{
    build_trace, catalog, run_catalog, InvariantId, ReferenceStackProvider, StackProvider,
};
use lookout_engine::needle_harness::{needle_registry, report_digest, run_needles};

fn providers() -> [ReferenceStackProvider; 2] {
    [
        ReferenceStackProvider::perimeter(),
        ReferenceStackProvider::overworld(),
    ]
}

#[test]
fn both_domains_pass_the_catalog_across_seeds() {
    for provider in providers() {
        for seed in [0u64, 1, 7, 99] {
            let trace = build_trace(&provider, seed);
            let violations = run_catalog(&trace);
            assert!(
                violations.is_empty(),
                "{} seed {seed}: {violations:?}",
                provider.domain()
            );
        }
    }
}

#[test]
fn needle_suite_matches_expected_signatures_in_both_domains() {
    for provider in providers() {
        let report = run_needles(&provider, 7);
        assert!(report.summary.baseline_clean);
        assert_eq!(report.summary.failed, 0, "{:#?}", report.outcomes);
        assert_eq!(
            report.summary.total_needles,
            needle_registry().len()
        );
        report.enforce_ci_gate().expect("gate");
    }
}

#[test]
fn catalog_and_needles_cover_the_same_invariant_space() {
    let catalog_ids: BTreeSet<InvariantId> = catalog().iter().map(|entry| entry.id).collect();
    let needle_targets: BTreeSet<InvariantId> = needle_registry()
        .iter()
        .flat_map(|needle| needle.expected.iter().copied())
        .collect();
    assert_eq!(catalog_ids, needle_targets);
    assert_eq!(catalog_ids.len(), InvariantId::ALL.len());
}

#[test]
fn traces_are_reproducible_for_a_seed() {
    let provider = ReferenceStackProvider::perimeter();
    let a = build_trace(&provider, 42);
    let b = build_trace(&provider, 42);
    assert_eq!(a, b);

    let c = build_trace(&provider, 43);
    assert_ne!(a, c, "seed must drive scenario jitter");
}

#[test]
fn reports_serialize_for_artifact_collection() {
    let provider = ReferenceStackProvider::overworld();
    let report = run_needles(&provider, 5);
    let json = serde_json::to_value(&report).expect("serialize");
    assert_eq!(json["domain"], "overworld");
    assert_eq!(json["summary"]["baseline_clean"], true);
    assert!(json["outcomes"].as_array().is_some_and(|o| !o.is_empty()));
    assert_eq!(report_digest(&report).len(), 64);
}

#[test]
fn domains_differ_only_in_classification() {
    let perimeter = build_trace(&ReferenceStackProvider::perimeter(), 7);
    let overworld = build_trace(&ReferenceStackProvider::overworld(), 7);
    assert_eq!(perimeter.domain, "perimeter");
    assert_eq!(overworld.domain, "overworld");
    // Same script shape either way.
    assert_eq!(perimeter.steps.len(), overworld.steps.len());
    assert_eq!(perimeter.suppression_ceiling, overworld.suppression_ceiling);
}
