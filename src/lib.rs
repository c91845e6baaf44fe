//! Zero-registry service mesh substrate.
//!
//! Nodes announce themselves on a shared discovery medium, dial every
//! peer they sight in their namespace, authorize, and mirror each other's
//! service registries. Applications publish [`Service`]s with named
//! methods and declare requirements with [`Node::need`]; requirements
//! resolve to [`RemoteService`] proxies that survive peer restarts
//! through transparent rebinding.
//!
//! Transport, hosting and discovery are pluggable through the
//! [`Connector`], [`Endpoint`] and [`Discovery`] traits; [`memory`]
//! provides in-process implementations of all three.

#![deny(missing_docs)]

pub mod client;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod service;
pub mod transport;

pub use client::{Client, ClientEvent, ClientOptions};
pub use discovery::{Discovery, PeerAddr, SharedDiscovery, Sighting};
pub use error::{Error, Result};
pub use protocol::{Envelope, Registry, ServiceDescriptor};
pub use proxy::{identity_transform, ProxyEvent, RemoteService, ResultTransform};
pub use server::{accept_all, AuthPredicate, Node, NodeEvent, NodeOptions};
pub use service::Service;
pub use transport::{
    CallArgs, Connector, Endpoint, Link, LinkEvent, SharedConnector, SharedEndpoint, SharedLink,
};
