//! Cluster membership and controller election.
//!
//! Nodes form a full mesh over `strata-net` transports, announce
//! themselves with peer-aware messages, and elect a controller by
//! majority vote once every peer is reachable.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod coordinator;
pub mod election;
pub mod messages;
pub mod peer;

pub use coordinator::{ClusterConfig, NodeCoordinator};
pub use election::ControllerElection;
pub use messages::{ControllerVote, PeerAware};
pub use peer::{PeerEndpoint, PeerEvent, PeerManager};
