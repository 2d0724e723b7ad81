//! Ad-break state: the per-channel state machine, the single-writer lane
//! that owns it, and the KV projection used by the stateless fast path.

pub mod kv;
pub mod lane;
pub mod state;

pub use kv::{AdBreakKv, AdBreakRecord, Scte35Meta};
pub use lane::{BreakView, ChannelLane, ChannelLanes, LaneDeps, StitchMode};
pub use state::{AdBreakState, BreakSlot, BreakSource, SharedManifestPlan};
