//! Shared contracts for the nimbus cluster.
//!
//! Every other crate in this workspace (`nimbus-consensus`, `nimbus-fabric`,
//! `nimbus-registry`, `nimbus-scheduler`, `nimbus-security`, `nimbus-node`)
//! depends on this one and none of the others, so the call-scoped
//! vocabulary — errors, ids, cancellation, deadlines, security context,
//! configuration, audit, runtime — only has to be agreed on once.

pub mod audit;
pub mod cluster;
pub mod configuration;
pub mod contract;
pub mod error;
pub mod ids;
pub mod limits;
pub mod model;
pub mod retry;
pub mod runtime;
pub mod sealed;
pub mod security;
pub mod types;

pub use contract::{BoxFuture, CallContext, CallContextBuilder, Cancellation, Deadline};
pub use error::{ErrorKind, NimbusError, Result};
