#![forbid(unsafe_code)]

//! Bounded perceptual track engine with a snapshot/delta saliency stream.
//!
//! Noisy per-tick observations go in; a bounded set of persistent,
//! risk-scored, uncertainty-aware tracks comes out, streamed to a
//! downstream reasoner as versioned, sequenced envelopes. The consumer-side
//! reducer rehydrates a mirrored view from that stream under at-least-once,
//! reorderable delivery.
//!
//! Both the engine and the reducer are synchronous reducers over explicit
//! state: no I/O, no suspension, no interior locking. The conformance
//! catalog and needle harness prove the guarantees hold for any plugged-in
//! implementation, across domains.

pub mod conformance_catalog;
pub mod evidence;
pub mod needle_harness;
pub mod risk;
pub mod saliency_protocol;
pub mod stream_reducer;
pub mod track;
pub mod track_engine;
pub mod track_identity;
