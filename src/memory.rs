//! In-process collaborators: a loopback transport and discovery medium.
//!
//! `MemNetwork` hosts any number of endpoints keyed by port and wires
//! connectors, links and discovery against them without touching a real
//! network. Intended for tests and embedded single-process meshes; the
//! semantics mirror a real backend, including abrupt endpoint loss via
//! [`MemNetwork::take_down`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tracing::trace;

use crate::discovery::{Discovery, PeerAddr, SharedDiscovery, Sighting};
use crate::error::{Error, Result};
use crate::transport::{
    CallArgs, ChannelStream, Connector, Endpoint, Link, LinkEvent, LinkEvents, MethodHandler,
    SharedConnector, SharedEndpoint, SharedLink,
};

/// Host name every in-memory peer address carries.
pub const MEM_HOST: &str = "mem";

/// Close code used when an endpoint is taken down under its links.
const ABNORMAL_CLOSE: i64 = 1006;
/// Close code used for a locally requested close.
const NORMAL_CLOSE: i64 = 1000;

/// A process-local network of endpoints, connectors and discovery.
#[derive(Clone, Default)]
pub struct MemNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    endpoints: Mutex<HashMap<String, Arc<EndpointState>>>,
    sightings: broadcast::Sender<Sighting>,
    next_link: AtomicU64,
}

impl Default for NetworkInner {
    fn default() -> Self {
        let (sightings, _) = broadcast::channel(256);
        Self {
            endpoints: Mutex::new(HashMap::new()),
            sightings,
            next_link: AtomicU64::new(1),
        }
    }
}

impl MemNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// The address an endpoint on `port` is reachable at.
    pub fn addr(port: u16) -> PeerAddr {
        PeerAddr::new(MEM_HOST, port)
    }

    /// Create the hosting endpoint listening on `port`.
    ///
    /// Re-binding an occupied port replaces the endpoint; links into the
    /// displaced one are closed as if it had been taken down.
    pub fn endpoint(&self, port: u16) -> SharedEndpoint {
        let state = Arc::new(EndpointState::default());
        let displaced = self
            .inner
            .endpoints
            .lock()
            .expect("lock poisoned")
            .insert(Self::addr(port).key(), Arc::clone(&state));
        if let Some(endpoint) = displaced {
            endpoint.tear_down();
        }
        state
    }

    /// A connector dialing into this network.
    pub fn connector(&self) -> SharedConnector {
        Arc::new(MemConnector {
            inner: Arc::clone(&self.inner),
        })
    }

    /// A discovery handle over this network's announcement medium.
    pub fn discovery(&self) -> SharedDiscovery {
        Arc::new(MemDiscovery {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Abruptly remove the endpoint on `port`, closing every link into it
    /// with an abnormal close code.
    pub fn take_down(&self, port: u16) {
        let removed = self
            .inner
            .endpoints
            .lock()
            .expect("lock poisoned")
            .remove(&Self::addr(port).key());
        if let Some(endpoint) = removed {
            trace!(port, "taking endpoint down");
            endpoint.tear_down();
        }
    }
}

/// One hosted endpoint: a method table and broadcast-channel subscribers.
#[derive(Default)]
struct EndpointState {
    methods: Mutex<HashMap<String, MethodHandler>>,
    channels: Mutex<HashMap<String, Vec<ChannelSub>>>,
    links: Mutex<Vec<Weak<LinkState>>>,
}

struct ChannelSub {
    link: u64,
    sender: mpsc::UnboundedSender<Value>,
}

impl EndpointState {
    fn drop_subscriptions(&self, link: u64) {
        let mut channels = self.channels.lock().expect("lock poisoned");
        for subs in channels.values_mut() {
            subs.retain(|sub| sub.link != link);
        }
    }

    /// Close every link into this endpoint abnormally and drop all
    /// channel subscribers.
    fn tear_down(&self) {
        let links: Vec<Weak<LinkState>> = self
            .links
            .lock()
            .expect("lock poisoned")
            .drain(..)
            .collect();
        for link in links {
            if let Some(link) = link.upgrade() {
                link.shut(ABNORMAL_CLOSE);
            }
        }
        self.channels.lock().expect("lock poisoned").clear();
    }
}

impl Endpoint for EndpointState {
    fn register(&self, method: &str, handler: MethodHandler) {
        self.methods
            .lock()
            .expect("lock poisoned")
            .insert(method.to_string(), handler);
    }

    fn define_channel(&self, channel: &str) {
        self.channels
            .lock()
            .expect("lock poisoned")
            .entry(channel.to_string())
            .or_default();
    }

    fn broadcast(&self, channel: &str, payload: Value) {
        let mut channels = self.channels.lock().expect("lock poisoned");
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|sub| sub.sender.send(payload.clone()).is_ok());
        }
    }
}

/// Connection phase, published through a watch so late lifecycle
/// subscribers still observe the current state.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Opening,
    Open,
    Closed(i64),
}

/// One loopback link into an endpoint.
struct LinkState {
    id: u64,
    remote: Weak<EndpointState>,
    phase: watch::Sender<Phase>,
}

impl LinkState {
    /// Transition to `Closed` once; later calls are no-ops.
    fn shut(&self, code: i64) {
        let closed = self.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Closed(_)) {
                false
            } else {
                *phase = Phase::Closed(code);
                true
            }
        });
        if closed {
            if let Some(remote) = self.remote.upgrade() {
                remote.drop_subscriptions(self.id);
            }
        }
    }
}

#[async_trait]
impl Link for LinkState {
    fn id(&self) -> u64 {
        self.id
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        if matches!(*self.phase.borrow(), Phase::Closed(_)) {
            return Err(Error::LinkClosed);
        }
        let remote = self.remote.upgrade().ok_or(Error::LinkClosed)?;
        let handler = remote
            .methods
            .lock()
            .expect("lock poisoned")
            .get(method)
            .cloned()
            .ok_or_else(|| Error::call(method, "no such method"))?;
        handler(CallArgs::from_wire(Value::Array(args))).await
    }

    fn subscribe(&self, channel: &str) -> ChannelStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(remote) = self.remote.upgrade() {
            remote
                .channels
                .lock()
                .expect("lock poisoned")
                .entry(channel.to_string())
                .or_default()
                .push(ChannelSub {
                    link: self.id,
                    sender,
                });
        }
        UnboundedReceiverStream::new(receiver).boxed()
    }

    fn lifecycle(&self) -> LinkEvents {
        let mut phase = self.phase.subscribe();
        Box::pin(async_stream::stream! {
            let mut reported_open = false;
            loop {
                let current = *phase.borrow_and_update();
                match current {
                    Phase::Opening => {}
                    Phase::Open if !reported_open => {
                        reported_open = true;
                        yield LinkEvent::Open;
                    }
                    Phase::Open => {}
                    Phase::Closed(code) => {
                        yield LinkEvent::Closed { code };
                        break;
                    }
                }
                if phase.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn close(&self) {
        self.shut(NORMAL_CLOSE);
    }
}

struct MemConnector {
    inner: Arc<NetworkInner>,
}

#[async_trait]
impl Connector for MemConnector {
    async fn open(&self, peer: &PeerAddr) -> Result<SharedLink> {
        let endpoint = self
            .inner
            .endpoints
            .lock()
            .expect("lock poisoned")
            .get(&peer.key())
            .cloned()
            .ok_or_else(|| Error::connect(format!("no endpoint listening at {peer}")))?;
        let (phase, _) = watch::channel(Phase::Opening);
        let link = Arc::new(LinkState {
            id: self.inner.next_link.fetch_add(1, Ordering::Relaxed),
            remote: Arc::downgrade(&endpoint),
            phase,
        });
        endpoint
            .links
            .lock()
            .expect("lock poisoned")
            .push(Arc::downgrade(&link));
        // Loopback links open as soon as the endpoint is found.
        link.phase.send_replace(Phase::Open);
        Ok(link)
    }
}

struct MemDiscovery {
    inner: Arc<NetworkInner>,
}

impl Discovery for MemDiscovery {
    fn announce(&self, namespace: &str, port: u16) {
        let _ = self.inner.sightings.send(Sighting {
            namespace: namespace.to_string(),
            peer: MemNetwork::addr(port),
        });
    }

    fn sightings(&self) -> futures_util::stream::BoxStream<'static, Sighting> {
        BroadcastStream::new(self.inner.sightings.subscribe())
            .filter_map(|sighting| async move { sighting.ok() })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn calls_reach_registered_handlers() {
        let net = MemNetwork::new();
        let endpoint = net.endpoint(1);
        endpoint.register(
            "echo",
            Arc::new(|args: CallArgs| Box::pin(async move { Ok(args.into_single()) })),
        );

        let link = net
            .connector()
            .open(&MemNetwork::addr(1))
            .await
            .expect("open link");
        let result = link.call("echo", vec![json!("hi")]).await.expect("call");
        assert_eq!(result, json!("hi"));

        let err = link.call("missing", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Call { .. }));
    }

    #[tokio::test]
    async fn dialing_an_unknown_port_fails() {
        let net = MemNetwork::new();
        let err = net
            .connector()
            .open(&MemNetwork::addr(42))
            .await
            .err()
            .expect("no endpoint on that port");
        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    async fn late_lifecycle_subscribers_observe_open() {
        let net = MemNetwork::new();
        net.endpoint(1);
        let link = net
            .connector()
            .open(&MemNetwork::addr(1))
            .await
            .expect("open link");

        let mut lifecycle = link.lifecycle();
        assert_eq!(lifecycle.next().await, Some(LinkEvent::Open));

        link.close();
        assert_eq!(
            lifecycle.next().await,
            Some(LinkEvent::Closed { code: NORMAL_CLOSE })
        );
        assert_eq!(lifecycle.next().await, None);
    }

    #[tokio::test]
    async fn broadcasts_fan_out_and_stop_at_close() {
        let net = MemNetwork::new();
        let endpoint = net.endpoint(1);
        endpoint.define_channel("ticks");

        let connector = net.connector();
        let first = connector.open(&MemNetwork::addr(1)).await.expect("open");
        let second = connector.open(&MemNetwork::addr(1)).await.expect("open");
        let mut a = first.subscribe("ticks");
        let mut b = second.subscribe("ticks");

        endpoint.broadcast("ticks", json!(1));
        assert_eq!(a.next().await, Some(json!(1)));
        assert_eq!(b.next().await, Some(json!(1)));

        second.close();
        endpoint.broadcast("ticks", json!(2));
        assert_eq!(a.next().await, Some(json!(2)));
        assert_eq!(b.next().await, None);
    }

    #[tokio::test]
    async fn rebinding_a_port_closes_links_into_the_old_endpoint() {
        let net = MemNetwork::new();
        net.endpoint(1);
        let link = net
            .connector()
            .open(&MemNetwork::addr(1))
            .await
            .expect("open link");
        let mut lifecycle = link.lifecycle();
        assert_eq!(lifecycle.next().await, Some(LinkEvent::Open));

        net.endpoint(1);
        assert_eq!(
            lifecycle.next().await,
            Some(LinkEvent::Closed { code: ABNORMAL_CLOSE })
        );
        let err = link.call("anything", vec![]).await;
        assert!(matches!(err, Err(Error::LinkClosed)));
    }

    #[tokio::test]
    async fn take_down_closes_links_abnormally() {
        let net = MemNetwork::new();
        net.endpoint(1);
        let link = net
            .connector()
            .open(&MemNetwork::addr(1))
            .await
            .expect("open link");
        let mut lifecycle = link.lifecycle();
        assert_eq!(lifecycle.next().await, Some(LinkEvent::Open));

        net.take_down(1);
        assert_eq!(
            lifecycle.next().await,
            Some(LinkEvent::Closed { code: ABNORMAL_CLOSE })
        );
        let err = link.call("anything", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::LinkClosed));

        let mut sightings = net.discovery().sightings();
        net.discovery().announce("mesh", 1);
        let sighting = sightings.next().await.expect("sighting");
        assert_eq!(sighting.namespace, "mesh");
        assert_eq!(sighting.peer, MemNetwork::addr(1));
    }
}
