//! The peer-discovery collaborator seam.
//!
//! A discovery backend announces the local node under a namespace and
//! yields sightings of other nodes. Sightings carry no guarantees: the
//! same peer may be reported indefinitely, out-of-namespace peers are
//! delivered too, and a node may be told about itself.

use std::fmt;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Network address of a peer, as announced on the discovery medium.
///
/// Identity is the `host:port` key; addresses are never persisted beyond
/// the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    /// Host name or address.
    pub host: String,
    /// Port the peer's endpoint listens on.
    pub port: u16,
}

impl PeerAddr {
    /// Create a peer address.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Identity key used for deduplication.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A single peer sighting on the discovery medium.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    /// Namespace the peer announced under.
    pub namespace: String,
    /// The announced address.
    pub peer: PeerAddr,
}

/// A pluggable peer discovery backend.
pub trait Discovery: Send + Sync + 'static {
    /// Announce the local node under a namespace. Fire-and-forget and
    /// idempotent; the orchestrator repeats it on a timer.
    fn announce(&self, namespace: &str, port: u16);

    /// Subscribe to peer sightings.
    fn sightings(&self) -> BoxStream<'static, Sighting>;
}

/// Shared handle to a discovery backend.
pub type SharedDiscovery = Arc<dyn Discovery>;
