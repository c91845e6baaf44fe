//! The connection manager: owns every outbound connection, runs the
//! authorization and registry-sync protocol per link, and resolves
//! pending service requirements as descriptors arrive.
//!
//! Each connection is driven by its own spawned task consuming that
//! link's lifecycle stream, so no connection can stall another. Shared
//! structures (found services, pending requirements, rejected peers) are
//! only touched from those callback paths, never held across awaits.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::{self, BoxFuture};
use futures_util::{FutureExt, StreamExt, TryFutureExt};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use crate::discovery::PeerAddr;
use crate::error::{Error, Result};
use crate::protocol::{Registry, ADD_SERVICE_CHANNEL, AUTHORIZE_METHOD, SERVICES_METHOD};
use crate::proxy::{identity_transform, ProxyEvent, RemoteService, ResultTransform};
use crate::transport::{LinkEvent, LinkEvents, SharedConnector, SharedLink};

/// Configuration for a connection manager.
pub struct ClientOptions {
    /// Credential presented during the authorization handshake.
    pub credential: Value,
    /// Transform applied to every resolved call envelope.
    pub transform: ResultTransform,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            credential: Value::Null,
            transform: identity_transform(),
        }
    }
}

/// Local events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The peer rejected this node's credential. The peer is retired from
    /// reconnection attempts for the process lifetime.
    Unauthorized {
        /// The rejecting peer.
        peer: PeerAddr,
    },
    /// A connection closed.
    Close {
        /// The peer whose connection closed.
        peer: PeerAddr,
        /// Transport-level close code.
        code: i64,
        /// Names of the services that lost their link.
        lost: Vec<String>,
    },
    /// A collaborator error on one connection. Not terminal.
    Error {
        /// The peer the error relates to.
        peer: PeerAddr,
        /// Error description.
        message: String,
    },
}

/// A pending requirement for a not-yet-found service.
struct Required {
    name: String,
    resolve: oneshot::Sender<RemoteService>,
}

/// Discovered proxies and unresolved requirements, guarded as one unit.
///
/// A single lock covers both maps so a requirement is either resolved
/// against the current `found` set or registered before any later
/// registry update drains `pending`; nothing can slip between the two.
#[derive(Default)]
struct ServiceTable {
    found: HashMap<String, RemoteService>,
    pending: Vec<Required>,
}

/// Manages outbound connections and the remote-service registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connector: SharedConnector,
    credential: Value,
    transform: ResultTransform,
    services: Mutex<ServiceTable>,
    rejected: Mutex<HashSet<String>>,
    events: broadcast::Sender<ClientEvent>,
}

impl Client {
    /// Create a connection manager.
    pub fn new(connector: SharedConnector, options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ClientInner {
                connector,
                credential: options.credential,
                transform: options.transform,
                services: Mutex::new(ServiceTable::default()),
                rejected: Mutex::new(HashSet::new()),
                events,
            }),
        }
    }

    /// Subscribe to connection-manager events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Open a connection to a peer and drive its protocol in the
    /// background.
    pub async fn open(&self, peer: PeerAddr) -> Result<()> {
        debug!(peer = %peer, "opening connection");
        let link = self.inner.connector.open(&peer).await?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(drive_connection(inner, peer, link));
        Ok(())
    }

    /// Declare required services by name.
    ///
    /// Names already discovered resolve immediately with their existing
    /// proxy; the rest resolve as matching descriptors arrive. The
    /// returned future completes only once every name has resolved, with
    /// proxies in the order the names were given. Registration happens
    /// eagerly, before the future is first polled.
    pub fn need(
        &self,
        names: &[&str],
    ) -> impl Future<Output = Result<Vec<RemoteService>>> + 'static {
        let mut waiters: Vec<BoxFuture<'static, Result<RemoteService>>> =
            Vec::with_capacity(names.len());
        let mut table = self.inner.services.lock().expect("lock poisoned");
        for &name in names {
            match table.found.get(name) {
                Some(proxy) => waiters.push(future::ready(Ok(proxy.clone())).boxed()),
                None => {
                    let (resolve, resolved) = oneshot::channel();
                    table.pending.push(Required {
                        name: name.to_string(),
                        resolve,
                    });
                    waiters.push(resolved.map_err(|_| Error::Shutdown).boxed());
                }
            }
        }
        drop(table);
        future::try_join_all(waiters)
    }

    /// Look up an already-discovered service.
    pub fn found(&self, name: &str) -> Option<RemoteService> {
        self.inner
            .services
            .lock()
            .expect("lock poisoned")
            .found
            .get(name)
            .cloned()
    }

    /// Whether this peer's last connection was rejected during
    /// authorization.
    pub fn is_rejected(&self, peer: &PeerAddr) -> bool {
        self.inner
            .rejected
            .lock()
            .expect("lock poisoned")
            .contains(&peer.key())
    }
}

/// Per-connection protocol driver.
///
/// Opening -> Authorizing -> Syncing -> Active, with Rejected and Closed
/// terminal. Every transition is driven by this link's own events only.
async fn drive_connection(inner: Arc<ClientInner>, peer: PeerAddr, link: SharedLink) {
    let mut lifecycle = link.lifecycle();

    // Opening: wait for the transport to come up.
    loop {
        match lifecycle.next().await {
            Some(LinkEvent::Open) => break,
            Some(LinkEvent::Error { message }) => {
                let _ = inner.events.send(ClientEvent::Error {
                    peer: peer.clone(),
                    message,
                });
            }
            Some(LinkEvent::Closed { code }) => {
                inner.finish(&peer, &link, code);
                return;
            }
            None => {
                inner.finish(&peer, &link, 0);
                return;
            }
        }
    }
    debug!(peer = %peer, "link open, authorizing");

    // Authorizing: one call with the configured credential decides the
    // connection's fate.
    if let Err(err) = link
        .call(AUTHORIZE_METHOD, vec![inner.credential.clone()])
        .await
    {
        debug!(peer = %peer, error = %err, "authorization rejected");
        inner
            .rejected
            .lock()
            .expect("lock poisoned")
            .insert(peer.key());
        let _ = inner.events.send(ClientEvent::Unauthorized { peer: peer.clone() });
        link.close();
        let code = await_close(&mut lifecycle).await;
        inner.finish(&peer, &link, code);
        return;
    }

    // Syncing: subscribe before fetching the snapshot so no add-service
    // broadcast is lost; buffered updates are applied only after the
    // snapshot.
    let mut adds = link.subscribe(ADD_SERVICE_CHANNEL);
    match link.call(SERVICES_METHOD, Vec::new()).await {
        Ok(raw) => match serde_json::from_value::<Registry>(raw) {
            Ok(snapshot) => inner.apply_registry(&link, snapshot),
            Err(err) => warn!(peer = %peer, error = %err, "malformed registry snapshot"),
        },
        Err(err) => warn!(peer = %peer, error = %err, "registry sync failed"),
    }

    // Active: process add-service updates until the transport closes.
    let mut adds_open = true;
    loop {
        tokio::select! {
            update = adds.next(), if adds_open => match update {
                Some(payload) => match serde_json::from_value::<Registry>(payload) {
                    Ok(update) => inner.apply_registry(&link, update),
                    Err(err) => {
                        trace!(peer = %peer, error = %err, "discarding malformed registry update");
                    }
                },
                None => adds_open = false,
            },
            event = lifecycle.next() => match event {
                Some(LinkEvent::Closed { code }) => {
                    inner.finish(&peer, &link, code);
                    return;
                }
                Some(LinkEvent::Error { message }) => {
                    let _ = inner.events.send(ClientEvent::Error {
                        peer: peer.clone(),
                        message,
                    });
                }
                Some(LinkEvent::Open) => {}
                None => {
                    inner.finish(&peer, &link, 0);
                    return;
                }
            },
        }
    }
}

async fn await_close(lifecycle: &mut LinkEvents) -> i64 {
    while let Some(event) = lifecycle.next().await {
        if let LinkEvent::Closed { code } = event {
            return code;
        }
    }
    0
}

impl ClientInner {
    /// Apply a registry snapshot or update from one link.
    ///
    /// Known names rebind their existing proxy (identity-preserving) and
    /// emit `Reopen`; new names create a proxy and resolve any pending
    /// requirements waiting on them.
    fn apply_registry(&self, link: &SharedLink, registry: Registry) {
        for (name, descriptor) in registry {
            // Lookup, insert and pending-drain happen under one lock so a
            // concurrent `need` can neither register after the drain nor
            // miss the insert, and two connections delivering the same
            // name cannot both create a proxy.
            let mut table = self.services.lock().expect("lock poisoned");
            if let Some(proxy) = table.found.get(&name).cloned() {
                drop(table);
                debug!(service = %name, "rebinding remote service");
                proxy.refresh(descriptor);
                proxy.rebind(Arc::clone(link));
                proxy.notify(ProxyEvent::Reopen);
                continue;
            }

            debug!(service = %name, "storing remote service");
            let proxy = RemoteService::new(
                Arc::clone(link),
                descriptor,
                Arc::clone(&self.transform),
            );
            table.found.insert(name.clone(), proxy.clone());
            let (waiting, rest): (Vec<Required>, Vec<Required>) = table
                .pending
                .drain(..)
                .partition(|required| required.name == name);
            table.pending = rest;
            drop(table);

            for required in waiting {
                trace!(service = %name, "resolving required service");
                let _ = required.resolve.send(proxy.clone());
            }
        }
    }

    /// Terminal transition for one connection: notify every proxy bound
    /// to it and report the lost service names.
    fn finish(&self, peer: &PeerAddr, link: &SharedLink, code: i64) {
        let lost: Vec<RemoteService> = self
            .services
            .lock()
            .expect("lock poisoned")
            .found
            .values()
            .filter(|proxy| proxy.link_id() == link.id())
            .cloned()
            .collect();
        let names: Vec<String> = lost.iter().map(RemoteService::name).collect();
        for proxy in &lost {
            proxy.notify(ProxyEvent::Close);
        }
        debug!(peer = %peer, code, lost = names.len(), "connection closed");
        let _ = self.events.send(ClientEvent::Close {
            peer: peer.clone(),
            code,
            lost: names,
        });
    }
}
