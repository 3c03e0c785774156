//! Deterministic track identity.
//!
//! A track id is a Sha-256 digest over a versioned, domain-separated
//! preimage of (creation tick, quantized position, class code,
//! disambiguator). No per-observation feature data enters the preimage, so
//! identity is reproducible across independent implementations given the
//! same inputs. The derived `Ord` over the raw bytes is the deterministic
//! tie-break order used everywhere a victim or winner must be chosen.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::evidence::PositionBucket;

/// Domain-separation prefix for the track id preimage.
const TRACK_ID_DOMAIN: &[u8] = b"lookout.track-id.v1";

// ---------------------------------------------------------------------------
// TrackId
// ---------------------------------------------------------------------------

/// Stable identity of one tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub [u8; 32]);

impl TrackId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for byte in &self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

    /// Short prefix for log lines.
    pub fn short_hex(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track:{}", self.to_hex())
    }
}

/// Derive a track id from creation-time facts.
///
/// The disambiguator distinguishes tracks created from observations with
/// identical (tick, position, class); it is the only thing that does.
pub fn derive_track_id(
    created_tick: u64,
    position: &PositionBucket,
    class_code: u32,
    disambiguator: u64,
) -> TrackId {
    let mut hasher = Sha256::new();
    hasher.update(TRACK_ID_DOMAIN);
    hasher.update(created_tick.to_be_bytes());
    hasher.update(position.x.to_be_bytes());
    hasher.update(position.y.to_be_bytes());
    hasher.update(position.z.to_be_bytes());
    hasher.update(class_code.to_be_bytes());
    hasher.update(disambiguator.to_be_bytes());
    TrackId(hasher.finalize().into())
}

// ---------------------------------------------------------------------------
// Class-label codec
// ---------------------------------------------------------------------------

/// Stable integer code for a class label.
///
/// FNV-1a over the label bytes, folded to 32 bits. Non-cryptographic by
/// design: the code only needs to be stable and cheap, never secret.
pub fn class_enum_code(label: &str) -> u32 {
    let hash = fnv1a64(label.as_bytes());
    (hash ^ (hash >> 32)) as u32
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0001_0000_01b3;

    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
