//! Peer Fabric: gossip/rendezvous peer discovery, a mutual-TLS connection
//! manager with water-mark admission control, peer trust scoring, and
//! content-addressed chunk transfer.

pub mod chunk;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod fabric;
pub mod identity;
pub mod trust;

pub use chunk::{ChunkDigest, ChunkFetcher, ChunkStore, ChunkTransport, InMemoryChunkStore, DEFAULT_CHUNK_SIZE_BYTES};
pub use connection::{ConnectionManager, PeerConnection};
pub use discovery::{group_by_zone, InMemoryDiscovery, PeerDiscovery};
pub use error::FabricError;
pub use fabric::{DatagramTransport, PeerFabric, PeerFabricConfig, PeerStream};
pub use identity::{fingerprint_of, LocalIdentity};
pub use trust::{TrustTable, MIN_TRUSTED_SCORE};
