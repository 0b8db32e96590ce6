//! Module wiring for the `nimbusd` binary. Each module owns one seam
//! named in the external interfaces: configuration, on-disk layout,
//! certificates and identity, the Raft log and state machine, the fabric
//! RPC wire format and transport, the HTTP API, the CLI, and the
//! observability ambient stack. `host` composes all of them.

pub mod adapters;
pub mod certs;
pub mod cli;
pub mod config;
pub mod error;
pub mod fabric_net;
pub mod host;
pub mod http;
pub mod identity;
pub mod layout;
pub mod observability;
pub mod oidc;
pub mod raft_log;
pub mod raft_transport;
pub mod rpc;
pub mod state_machine;
