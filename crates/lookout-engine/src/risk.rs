//! Risk classification contract and reference domain classifiers.
//!
//! Risk is a pure function of (class label, proximity bucket, classification
//! uncertainty) supplied by the domain, not by the track engine. The required
//! method is `classify`; `classify_detailed` is an optional extension that a
//! classifier must advertise via `supports_detailed` before any caller may
//! rely on it. An undeclared or unimplemented extension fails closed, never
//! silently degrades.
//!
//! Contract: for fixed (class, proximity), `classify` is monotonically
//! non-increasing in `p_unknown`. Higher uncertainty must never raise risk.
//!
//! Fixed-point millionths (1_000_000 = 1.0) for fractional values.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// One whole unit in fixed-point millionths.
pub const MILLIONTHS_ONE: u32 = 1_000_000;

/// Uncertainty at or above this caps risk at `Low`.
const UNCERTAINTY_CAP_LOW: u32 = 850_000;

/// Uncertainty at or above this caps risk at `Moderate`.
const UNCERTAINTY_CAP_MODERATE: u32 = 600_000;

/// Uncertainty at or above this caps risk at `High`.
const UNCERTAINTY_CAP_HIGH: u32 = 350_000;

/// Proximity buckets at or below this escalate risk one step.
const PROXIMITY_ESCALATE_AT: u32 = 1;

/// Proximity buckets at or beyond this de-escalate risk one step.
const PROXIMITY_RELAX_AT: u32 = 6;

// ---------------------------------------------------------------------------
// RiskLevel — ordered domain scale
// ---------------------------------------------------------------------------

/// Ordered risk scale shared by every domain.
///
/// The derived `Ord` follows declaration order: `Negligible` is the lowest
/// level, `Critical` the highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Negligible,
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        Self::Negligible,
        Self::Low,
        Self::Moderate,
        Self::High,
        Self::Critical,
    ];

    /// Numeric rank, `Negligible` = 0 through `Critical` = 4.
    pub fn rank(self) -> u8 {
        match self {
            Self::Negligible => 0,
            Self::Low => 1,
            Self::Moderate => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Negligible => "negligible",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// One step up the scale. `Critical` is terminal.
    pub fn escalate(self) -> Self {
        match self {
            Self::Negligible => Self::Low,
            Self::Low => Self::Moderate,
            Self::Moderate => Self::High,
            Self::High => Self::Critical,
            Self::Critical => Self::Critical,
        }
    }

    /// One step down the scale. `Negligible` is terminal.
    pub fn de_escalate(self) -> Self {
        match self {
            Self::Negligible => Self::Negligible,
            Self::Low => Self::Negligible,
            Self::Moderate => Self::Low,
            Self::High => Self::Moderate,
            Self::Critical => Self::High,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum risk level admissible at the given uncertainty.
///
/// Monotonically non-increasing in `p_unknown`; classifiers clamp their base
/// assessment with this so sustained uncertainty suppresses elevated risk.
pub fn uncertainty_ceiling(p_unknown: u32) -> RiskLevel {
    if p_unknown >= UNCERTAINTY_CAP_LOW {
        RiskLevel::Low
    } else if p_unknown >= UNCERTAINTY_CAP_MODERATE {
        RiskLevel::Moderate
    } else if p_unknown >= UNCERTAINTY_CAP_HIGH {
        RiskLevel::High
    } else {
        RiskLevel::Critical
    }
}

/// Shared proximity adjustment: close contacts escalate, distant ones relax.
fn proximity_adjusted(base: RiskLevel, proximity_bucket: u32) -> RiskLevel {
    if proximity_bucket <= PROXIMITY_ESCALATE_AT {
        base.escalate()
    } else if proximity_bucket >= PROXIMITY_RELAX_AT {
        base.de_escalate()
    } else {
        base
    }
}

// ---------------------------------------------------------------------------
// RiskError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RiskError {
    /// The detailed-breakdown extension was invoked on a classifier that
    /// does not implement it.
    #[error("detailed risk breakdown is not supported by this classifier")]
    DetailedUnsupported,
}

/// Stable error code for structured logging and artifacts.
pub fn error_code(err: &RiskError) -> &'static str {
    match err {
        RiskError::DetailedUnsupported => "LK_RISK_DETAILED_UNSUPPORTED",
    }
}

// ---------------------------------------------------------------------------
// RiskBreakdown — optional extension payload
// ---------------------------------------------------------------------------

/// Structured breakdown returned by the optional detailed extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskBreakdown {
    pub class_label: String,
    pub proximity_bucket: u32,
    pub p_unknown: u32,
    /// Class-intrinsic assessment before adjustments.
    pub base: RiskLevel,
    /// Base after the proximity adjustment.
    pub proximity_adjusted: RiskLevel,
    /// Cap imposed by the current uncertainty.
    pub uncertainty_ceiling: RiskLevel,
    /// Final level: proximity-adjusted base clamped by the ceiling.
    pub level: RiskLevel,
}

// ---------------------------------------------------------------------------
// RiskClassifier — the domain-supplied capability
// ---------------------------------------------------------------------------

/// Domain-supplied risk classification capability.
///
/// `classify` must be monotonically non-increasing in `p_unknown` for fixed
/// (class, proximity). `classify_detailed` is extension-gated: callers that
/// want it must verify `supports_detailed` at configuration time, and the
/// default implementation fails rather than degrading.
pub trait RiskClassifier {
    fn classify(&self, class_label: &str, proximity_bucket: u32, p_unknown: u32) -> RiskLevel;

    /// Whether the detailed-breakdown extension is implemented.
    fn supports_detailed(&self) -> bool {
        false
    }

    fn classify_detailed(
        &self,
        class_label: &str,
        proximity_bucket: u32,
        p_unknown: u32,
    ) -> Result<RiskBreakdown, RiskError> {
        let _ = (class_label, proximity_bucket, p_unknown);
        Err(RiskError::DetailedUnsupported)
    }
}

// ---------------------------------------------------------------------------
// PerimeterRiskClassifier — security domain
// ---------------------------------------------------------------------------

/// Security-perimeter domain: intruders, drones, vehicles, animals.
///
/// Implements the detailed-breakdown extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerimeterRiskClassifier;

impl PerimeterRiskClassifier {
    fn base(class_label: &str) -> RiskLevel {
        match class_label {
            "intruder" => RiskLevel::Critical,
            "drone" => RiskLevel::High,
            "vehicle" => RiskLevel::Moderate,
            "animal" => RiskLevel::Low,
            // Unrecognized contacts are treated as moderate until classified.
            _ => RiskLevel::Moderate,
        }
    }

    fn breakdown(class_label: &str, proximity_bucket: u32, p_unknown: u32) -> RiskBreakdown {
        let base = Self::base(class_label);
        let adjusted = proximity_adjusted(base, proximity_bucket);
        let ceiling = uncertainty_ceiling(p_unknown);
        RiskBreakdown {
            class_label: class_label.to_string(),
            proximity_bucket,
            p_unknown,
            base,
            proximity_adjusted: adjusted,
            uncertainty_ceiling: ceiling,
            level: adjusted.min(ceiling),
        }
    }
}

impl RiskClassifier for PerimeterRiskClassifier {
    fn classify(&self, class_label: &str, proximity_bucket: u32, p_unknown: u32) -> RiskLevel {
        Self::breakdown(class_label, proximity_bucket, p_unknown).level
    }

    fn supports_detailed(&self) -> bool {
        true
    }

    fn classify_detailed(
        &self,
        class_label: &str,
        proximity_bucket: u32,
        p_unknown: u32,
    ) -> Result<RiskBreakdown, RiskError> {
        Ok(Self::breakdown(class_label, proximity_bucket, p_unknown))
    }
}

// ---------------------------------------------------------------------------
// OverworldRiskClassifier — game domain
// ---------------------------------------------------------------------------

/// Block-game overworld domain: hostile mobs and villagers.
///
/// Deliberately does NOT implement the detailed extension; it is the
/// fail-closed counterexample for the extension gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverworldRiskClassifier;

impl OverworldRiskClassifier {
    fn base(class_label: &str) -> RiskLevel {
        match class_label {
            "creeper" => RiskLevel::Critical,
            "skeleton" | "zombie" => RiskLevel::High,
            "spider" | "witch" => RiskLevel::Moderate,
            "villager" => RiskLevel::Negligible,
            _ => RiskLevel::Low,
        }
    }
}

impl RiskClassifier for OverworldRiskClassifier {
    fn classify(&self, class_label: &str, proximity_bucket: u32, p_unknown: u32) -> RiskLevel {
        let adjusted = proximity_adjusted(Self::base(class_label), proximity_bucket);
        adjusted.min(uncertainty_ceiling(p_unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Negligible < RiskLevel::Low);
        assert!(RiskLevel::High < RiskLevel::Critical);
        for pair in RiskLevel::ALL.windows(2) {
            assert_eq!(pair[0].rank() + 1, pair[1].rank());
        }
    }

    #[test]
    fn escalate_and_de_escalate_saturate() {
        assert_eq!(RiskLevel::Critical.escalate(), RiskLevel::Critical);
        assert_eq!(RiskLevel::Negligible.de_escalate(), RiskLevel::Negligible);
        assert_eq!(RiskLevel::Moderate.escalate(), RiskLevel::High);
    }

    #[test]
    fn uncertainty_ceiling_is_monotone() {
        let mut prev = uncertainty_ceiling(0);
        for p_unknown in (0..=MILLIONTHS_ONE).step_by(50_000) {
            let ceiling = uncertainty_ceiling(p_unknown);
            assert!(ceiling <= prev, "ceiling rose at p_unknown={p_unknown}");
            prev = ceiling;
        }
    }

    #[test]
    fn perimeter_classify_is_monotone_in_uncertainty() {
        let classifier = PerimeterRiskClassifier;
        for label in ["intruder", "drone", "vehicle", "animal", "anomaly"] {
            for proximity in 0..8 {
                let mut prev = classifier.classify(label, proximity, 0);
                for p_unknown in (0..=MILLIONTHS_ONE).step_by(25_000) {
                    let level = classifier.classify(label, proximity, p_unknown);
                    assert!(level <= prev, "{label}@{proximity} rose at {p_unknown}");
                    prev = level;
                }
            }
        }
    }

    #[test]
    fn overworld_classify_is_monotone_in_uncertainty() {
        let classifier = OverworldRiskClassifier;
        for label in ["creeper", "zombie", "villager", "slime"] {
            for proximity in 0..8 {
                let mut prev = classifier.classify(label, proximity, 0);
                for p_unknown in (0..=MILLIONTHS_ONE).step_by(25_000) {
                    let level = classifier.classify(label, proximity, p_unknown);
                    assert!(level <= prev);
                    prev = level;
                }
            }
        }
    }

    #[test]
    fn proximity_escalates_close_contacts() {
        let classifier = PerimeterRiskClassifier;
        assert_eq!(classifier.classify("drone", 0, 0), RiskLevel::Critical);
        assert_eq!(classifier.classify("drone", 3, 0), RiskLevel::High);
        assert_eq!(classifier.classify("drone", 7, 0), RiskLevel::Moderate);
    }

    #[test]
    fn detailed_extension_fails_closed_by_default() {
        let classifier = OverworldRiskClassifier;
        assert!(!classifier.supports_detailed());
        let err = classifier
            .classify_detailed("creeper", 1, 0)
            .expect_err("extension must not silently degrade");
        assert_eq!(err, RiskError::DetailedUnsupported);
        assert_eq!(error_code(&err), "LK_RISK_DETAILED_UNSUPPORTED");
    }

    #[test]
    fn detailed_breakdown_matches_classify() {
        let classifier = PerimeterRiskClassifier;
        assert!(classifier.supports_detailed());
        let breakdown = classifier
            .classify_detailed("intruder", 4, 700_000)
            .expect("supported");
        assert_eq!(
            breakdown.level,
            classifier.classify("intruder", 4, 700_000)
        );
        assert_eq!(breakdown.base, RiskLevel::Critical);
        assert_eq!(breakdown.uncertainty_ceiling, RiskLevel::Moderate);
        assert_eq!(breakdown.level, RiskLevel::Moderate);
    }
}
