//! The orchestrator: hosts local services, announces the node on the
//! discovery medium, dials sighted peers and guards the authorization
//! gate.
//!
//! A node is both sides of the mesh at once. It owns a hosting endpoint
//! for inbound calls and an embedded [`Client`] for outbound connections,
//! so a process can publish services and require remote ones through one
//! handle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::client::{Client, ClientEvent, ClientOptions};
use crate::discovery::{PeerAddr, SharedDiscovery, Sighting};
use crate::error::{Error, Result};
use crate::protocol::{
    Registry, ADD_SERVICE_CHANNEL, AUTHORIZE_METHOD, SERVICES_METHOD, SERVICE_EVENT_CHANNEL,
};
use crate::proxy::{identity_transform, RemoteService, ResultTransform};
use crate::service::Service;
use crate::transport::{CallArgs, SharedConnector, SharedEndpoint};

/// Decides whether a presented credential may join the mesh.
pub type AuthPredicate = Arc<dyn Fn(Value) -> BoxFuture<'static, bool> + Send + Sync>;

/// An authorization predicate that admits every credential.
pub fn accept_all() -> AuthPredicate {
    Arc::new(|_credential| async { true }.boxed())
}

/// Configuration for an orchestrator node.
pub struct NodeOptions {
    /// Interval between discovery announcements.
    pub announce_interval: Duration,
    /// Credential this node presents when dialing peers.
    pub credential: Value,
    /// Transform applied to call results resolved through this node's
    /// proxies.
    pub transform: ResultTransform,
    /// Gate for credentials presented by dialing peers.
    pub authorize: AuthPredicate,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(5),
            credential: Value::Null,
            transform: identity_transform(),
            authorize: accept_all(),
        }
    }
}

/// Local events emitted by a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// A peer rejected this node's credential.
    Unauthorized {
        /// The rejecting peer.
        peer: PeerAddr,
    },
    /// An outbound connection closed; the peer becomes eligible for
    /// rediscovery unless it rejected us.
    ConnectionClosed {
        /// The disconnected peer.
        peer: PeerAddr,
        /// Services lost with the connection.
        lost: Vec<String>,
    },
    /// A non-fatal collaborator error.
    Error {
        /// Error description.
        message: String,
    },
}

/// A mesh node: service host, announcer and peer dialer in one.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    namespace: String,
    port: u16,
    endpoint: SharedEndpoint,
    discovery: SharedDiscovery,
    client: Client,
    services: Mutex<Vec<Service>>,
    known_peers: Mutex<HashSet<String>>,
    started: AtomicBool,
    announce_interval: Duration,
    events: broadcast::Sender<NodeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node hosting on `endpoint` and announcing `port` under
    /// `namespace`.
    pub fn new(
        namespace: impl Into<String>,
        port: u16,
        endpoint: SharedEndpoint,
        connector: SharedConnector,
        discovery: SharedDiscovery,
        options: NodeOptions,
    ) -> Self {
        let client = Client::new(
            connector,
            ClientOptions {
                credential: options.credential,
                transform: options.transform,
            },
        );
        endpoint.define_channel(ADD_SERVICE_CHANNEL);
        endpoint.define_channel(SERVICE_EVENT_CHANNEL);

        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(NodeInner {
            namespace: namespace.into(),
            port,
            endpoint,
            discovery,
            client,
            services: Mutex::new(Vec::new()),
            known_peers: Mutex::new(HashSet::new()),
            started: AtomicBool::new(false),
            announce_interval: options.announce_interval,
            events,
            tasks: Mutex::new(Vec::new()),
        });
        install_registry_method(&inner);
        install_authorize_method(&inner, options.authorize);
        Self { inner }
    }

    /// Publish a local service.
    ///
    /// The service is attached to the hosting endpoint immediately. Once
    /// the node has started announcing, already-connected peers learn
    /// about it through an incremental registry broadcast.
    pub fn add_service(&self, service: Service) {
        info!(
            namespace = %self.inner.namespace,
            service = %service.name(),
            "publishing service"
        );
        service.attach(Arc::clone(&self.inner.endpoint));
        let descriptor = service.descriptor();
        self.inner
            .services
            .lock()
            .expect("lock poisoned")
            .push(service);

        if self.inner.started.load(Ordering::SeqCst) {
            let mut update = Registry::new();
            update.insert(descriptor.name.clone(), descriptor);
            match serde_json::to_value(&update) {
                Ok(payload) => self.inner.endpoint.broadcast(ADD_SERVICE_CHANNEL, payload),
                Err(err) => warn!(error = %err, "failed to encode registry update"),
            }
        }
    }

    /// Start consuming discovery sightings and connection events.
    pub fn listen(&self) {
        let sightings = self.inner.discovery.sightings();
        let watcher = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let mut sightings = sightings;
                while let Some(sighting) = sightings.next().await {
                    on_sighting(&inner, sighting).await;
                }
            })
        };
        let forwarder = {
            let inner = Arc::clone(&self.inner);
            let mut events = inner.client.events();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(ClientEvent::Close { peer, lost, .. }) => {
                            if !inner.client.is_rejected(&peer) {
                                inner
                                    .known_peers
                                    .lock()
                                    .expect("lock poisoned")
                                    .remove(&peer.key());
                            }
                            let _ = inner.events.send(NodeEvent::ConnectionClosed { peer, lost });
                        }
                        Ok(ClientEvent::Unauthorized { peer }) => {
                            let _ = inner.events.send(NodeEvent::Unauthorized { peer });
                        }
                        Ok(ClientEvent::Error { peer, message }) => {
                            let _ = inner.events.send(NodeEvent::Error {
                                message: format!("{peer}: {message}"),
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "dropped connection events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };
        let mut tasks = self.inner.tasks.lock().expect("lock poisoned");
        tasks.push(watcher);
        tasks.push(forwarder);
    }

    /// Start the periodic discovery announcement. Idempotent; the first
    /// announcement goes out immediately.
    pub fn announce(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            namespace = %self.inner.namespace,
            port = self.inner.port,
            "announcing node"
        );
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(inner.announce_interval);
            loop {
                ticks.tick().await;
                inner.discovery.announce(&inner.namespace, inner.port);
            }
        });
        self.inner
            .tasks
            .lock()
            .expect("lock poisoned")
            .push(handle);
    }

    /// Declare required remote services; see [`Client::need`].
    pub fn need(
        &self,
        names: &[&str],
    ) -> impl std::future::Future<Output = Result<Vec<RemoteService>>> + 'static {
        self.inner.client.need(names)
    }

    /// The embedded connection manager.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Subscribe to node events.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Stop announcing and consuming discovery. Existing connections are
    /// left to their transports.
    pub fn shutdown(&self) {
        debug!(namespace = %self.inner.namespace, "shutting down node");
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .expect("lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl NodeInner {
    /// Snapshot of every published service, keyed by name.
    fn registry(&self) -> Registry {
        self.services
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|service| {
                let descriptor = service.descriptor();
                (descriptor.name.clone(), descriptor)
            })
            .collect()
    }
}

/// React to one discovery sighting.
///
/// Every sighted peer key is recorded before the namespace filter runs,
/// so a peer seen under a foreign namespace is not re-examined each time
/// it is announced.
async fn on_sighting(inner: &Arc<NodeInner>, sighting: Sighting) {
    let key = sighting.peer.key();
    if !inner
        .known_peers
        .lock()
        .expect("lock poisoned")
        .insert(key.clone())
    {
        return;
    }
    if sighting.namespace != inner.namespace {
        trace!(
            peer = %sighting.peer,
            namespace = %sighting.namespace,
            "ignoring out-of-namespace peer"
        );
        return;
    }

    debug!(peer = %sighting.peer, "dialing sighted peer");
    if let Err(err) = inner.client.open(sighting.peer.clone()).await {
        warn!(peer = %sighting.peer, error = %err, "dial failed");
        inner
            .known_peers
            .lock()
            .expect("lock poisoned")
            .remove(&key);
        let _ = inner.events.send(NodeEvent::Error {
            message: format!("{}: {err}", sighting.peer),
        });
    }
}

/// Expose the registry snapshot as a well-known endpoint method.
fn install_registry_method(inner: &Arc<NodeInner>) {
    let weak = Arc::downgrade(inner);
    inner.endpoint.register(
        SERVICES_METHOD,
        Arc::new(move |_args: CallArgs| {
            let weak: Weak<NodeInner> = Weak::clone(&weak);
            Box::pin(async move {
                let inner = weak.upgrade().ok_or(Error::Shutdown)?;
                Ok(serde_json::to_value(inner.registry())?)
            })
        }),
    );
}

/// Expose the authorization gate as a well-known endpoint method.
fn install_authorize_method(inner: &Arc<NodeInner>, authorize: AuthPredicate) {
    inner.endpoint.register(
        AUTHORIZE_METHOD,
        Arc::new(move |args: CallArgs| {
            let authorize = Arc::clone(&authorize);
            Box::pin(async move {
                let credential = args.into_single();
                if authorize(credential).await {
                    Ok(Value::Bool(true))
                } else {
                    Err(Error::Unauthorized)
                }
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::MemNetwork;

    fn node_on(net: &MemNetwork, namespace: &str, port: u16, options: NodeOptions) -> Node {
        Node::new(
            namespace,
            port,
            net.endpoint(port),
            net.connector(),
            net.discovery(),
            options,
        )
    }

    #[tokio::test]
    async fn registry_method_reports_published_services() {
        let net = MemNetwork::new();
        let node = node_on(&net, "mesh", 1, NodeOptions::default());

        let service = Service::new("math");
        service.register("add", |_args| async move { Ok(json!(0)) });
        service.register("sub", |_args| async move { Ok(json!(0)) });
        node.add_service(service);

        let link = net
            .connector()
            .open(&MemNetwork::addr(1))
            .await
            .expect("open link");
        let raw = link.call(SERVICES_METHOD, Vec::new()).await.expect("call");
        let registry: Registry = serde_json::from_value(raw).expect("registry shape");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry["math"].methods, vec!["add", "sub"]);
    }

    #[tokio::test]
    async fn authorize_method_applies_the_predicate() {
        let net = MemNetwork::new();
        let options = NodeOptions {
            authorize: Arc::new(|credential| {
                async move { credential == json!("sesame") }.boxed()
            }),
            ..NodeOptions::default()
        };
        let _node = node_on(&net, "mesh", 1, options);

        let link = net
            .connector()
            .open(&MemNetwork::addr(1))
            .await
            .expect("open link");
        let ok = link
            .call(AUTHORIZE_METHOD, vec![json!("sesame")])
            .await
            .expect("accepted");
        assert_eq!(ok, json!(true));

        let err = link
            .call(AUTHORIZE_METHOD, vec![json!("wrong")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Call { .. } | Error::Unauthorized));
    }

    #[tokio::test]
    async fn add_service_after_start_broadcasts_an_update() {
        let net = MemNetwork::new();
        let node = node_on(&net, "mesh", 1, NodeOptions::default());
        node.announce();

        let link = net
            .connector()
            .open(&MemNetwork::addr(1))
            .await
            .expect("open link");
        let mut adds = link.subscribe(ADD_SERVICE_CHANNEL);

        let service = Service::new("late");
        service.register("ping", |_args| async move { Ok(json!("pong")) });
        node.add_service(service);

        let payload = adds.next().await.expect("update broadcast");
        let update: Registry = serde_json::from_value(payload).expect("registry shape");
        assert!(update.contains_key("late"));
        node.shutdown();
    }
}
