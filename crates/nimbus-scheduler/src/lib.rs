//! The Scheduler component: admission control, candidate scoring, and
//! dispatch-with-failover for inference requests (§4.D).

mod admission;
mod candidate;
mod dispatch;
mod error;
mod scheduler;
mod scoring;
mod types;

pub use admission::check_admission;
pub use candidate::{resolve_candidates, NodeStatsTable, PlacementLookup, SharedStats};
pub use dispatch::{dispatch_with_failover, DispatchOutcome, DispatchTransport};
pub use error::SchedulerError;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use scoring::{rank_candidates, select_best, CandidateStats, ScoreWeights};
pub use types::{IllegalTransition, InferenceRequest, RequestState};
