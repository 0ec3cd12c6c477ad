//! Segment evaluation and campaign membership resolution.

pub mod engine;
pub mod membership;
pub mod triggers;

pub use engine::{SegmentChanges, SegmentEvaluator, UserSegmentChanges};
pub use membership::{CampaignChanges, MembershipResolver};
pub use triggers::extract_event_triggers;
