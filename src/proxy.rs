//! Remote service proxies: client-side stand-ins for services discovered
//! on peers.
//!
//! A proxy is bound to one link at a time. The connection manager rebinds
//! it when the owning peer reconnects, so application code holds a single
//! proxy handle across the service's whole remote lifetime.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{Envelope, ServiceDescriptor, ServiceEvent, SERVICE_EVENT_CHANNEL};
use crate::transport::{ChannelStream, SharedLink};

/// Transform applied to every resolved call envelope before it reaches the
/// caller.
pub type ResultTransform = Arc<dyn Fn(Envelope) -> Envelope + Send + Sync>;

/// The identity transform.
pub fn identity_transform() -> ResultTransform {
    Arc::new(|envelope| envelope)
}

/// Local events emitted by a proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    /// The owning connection dropped. The proxy stays usable for event
    /// subscription and may be rebound later.
    Close,
    /// The owning peer re-established a service of the same name; the
    /// proxy has been rebound and calls work again.
    Reopen,
    /// An application event forwarded from the remote service.
    App {
        /// Event name as emitted by the remote service.
        name: String,
        /// Event payload.
        data: Value,
    },
}

/// Client-side proxy for a service discovered on a peer.
///
/// Cheap to clone; clones share identity. Method dispatch goes by name
/// lookup against the descriptor and always resolves through the link
/// bound at call time.
#[derive(Clone)]
pub struct RemoteService {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    descriptor: Mutex<ServiceDescriptor>,
    binding: Mutex<Binding>,
    transform: ResultTransform,
    events: broadcast::Sender<ProxyEvent>,
}

struct Binding {
    link: SharedLink,
    forward: JoinHandle<()>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if let Ok(binding) = self.binding.get_mut() {
            binding.forward.abort();
        }
    }
}

impl RemoteService {
    pub(crate) fn new(
        link: SharedLink,
        descriptor: ServiceDescriptor,
        transform: ResultTransform,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let forward = spawn_forwarder(link.subscribe(SERVICE_EVENT_CHANNEL), events.clone());
        Self {
            inner: Arc::new(ProxyInner {
                descriptor: Mutex::new(descriptor),
                binding: Mutex::new(Binding { link, forward }),
                transform,
                events,
            }),
        }
    }

    /// The service name.
    pub fn name(&self) -> String {
        self.inner
            .descriptor
            .lock()
            .expect("lock poisoned")
            .name
            .clone()
    }

    /// Snapshot of the descriptor the proxy was built from.
    pub fn descriptor(&self) -> ServiceDescriptor {
        self.inner.descriptor.lock().expect("lock poisoned").clone()
    }

    /// The remote method names this proxy can call.
    pub fn methods(&self) -> Vec<String> {
        self.inner
            .descriptor
            .lock()
            .expect("lock poisoned")
            .methods
            .clone()
    }

    /// Subscribe to the proxy's local events: [`ProxyEvent::Close`],
    /// [`ProxyEvent::Reopen`] and forwarded [`ProxyEvent::App`] events.
    pub fn events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.inner.events.subscribe()
    }

    /// Invoke a remote method with positional arguments.
    ///
    /// Fails with [`Error::UnknownMethod`] when the descriptor does not
    /// list the method; remote handler failures propagate untouched.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Envelope> {
        let target = {
            let descriptor = self.inner.descriptor.lock().expect("lock poisoned");
            if !descriptor.has_method(method) {
                return Err(Error::UnknownMethod {
                    service: descriptor.name.clone(),
                    method: method.to_string(),
                });
            }
            format!("{}.{}", descriptor.name, method)
        };
        let link = self.link();
        let raw = link.call(&target, args).await?;
        let envelope: Envelope = serde_json::from_value(raw)?;
        Ok((self.inner.transform)(envelope))
    }

    fn link(&self) -> SharedLink {
        Arc::clone(&self.inner.binding.lock().expect("lock poisoned").link)
    }

    pub(crate) fn link_id(&self) -> u64 {
        self.inner.binding.lock().expect("lock poisoned").link.id()
    }

    /// Swap the bound link: stop forwarding from the old link, subscribe
    /// on the new one. Method stubs are untouched; they resolve through
    /// the live binding at call time. Connection-manager internal.
    pub(crate) fn rebind(&self, link: SharedLink) {
        let mut binding = self.inner.binding.lock().expect("lock poisoned");
        binding.forward.abort();
        let forward = spawn_forwarder(
            link.subscribe(SERVICE_EVENT_CHANNEL),
            self.inner.events.clone(),
        );
        *binding = Binding { link, forward };
    }

    /// Replace the method set with a freshly published descriptor.
    pub(crate) fn refresh(&self, descriptor: ServiceDescriptor) {
        *self.inner.descriptor.lock().expect("lock poisoned") = descriptor;
    }

    pub(crate) fn notify(&self, event: ProxyEvent) {
        let _ = self.inner.events.send(event);
    }
}

/// Re-publish service-event payloads from the bound link as local events.
fn spawn_forwarder(
    mut channel: ChannelStream,
    events: broadcast::Sender<ProxyEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = channel.next().await {
            match serde_json::from_value::<ServiceEvent>(payload) {
                Ok(event) => {
                    let _ = events.send(ProxyEvent::App {
                        name: event.name,
                        data: event.data,
                    });
                }
                Err(err) => trace!(error = %err, "discarding malformed service event"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::MemNetwork;
    use crate::service::Service;
    use crate::transport::CallArgs;

    // The network and service ride along so the endpoint outlives the
    // returned proxy.
    async fn math_proxy(transform: ResultTransform) -> (MemNetwork, Service, RemoteService) {
        let net = MemNetwork::new();
        let endpoint = net.endpoint(1);
        let service = Service::new("math");
        service.register("add", |args: CallArgs| async move {
            match args {
                CallArgs::Positional(values) => {
                    let sum: i64 = values.iter().filter_map(Value::as_i64).sum();
                    Ok(json!(sum))
                }
                CallArgs::Keyed(_) => Ok(json!(null)),
            }
        });
        let descriptor = service.descriptor();
        service.attach(endpoint);
        let link = net
            .connector()
            .open(&MemNetwork::addr(1))
            .await
            .expect("open link");
        let proxy = RemoteService::new(link, descriptor, transform);
        (net, service, proxy)
    }

    #[tokio::test]
    async fn forwards_calls_through_the_bound_link() {
        let (_net, _service, proxy) = math_proxy(identity_transform()).await;
        let envelope = proxy
            .call("add", vec![json!(2), json!(3)])
            .await
            .expect("remote call");
        assert_eq!(envelope.kind, "number");
        assert_eq!(envelope.data, json!(5));
    }

    #[tokio::test]
    async fn rejects_methods_missing_from_the_descriptor() {
        let (_net, _service, proxy) = math_proxy(identity_transform()).await;
        let err = proxy.call("mul", vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownMethod { service, method } if service == "math" && method == "mul"
        ));
    }

    #[tokio::test]
    async fn applies_the_result_transform() {
        let transform: ResultTransform = Arc::new(|mut envelope| {
            envelope.kind = format!("wrapped:{}", envelope.kind);
            envelope
        });
        let (_net, _service, proxy) = math_proxy(transform).await;
        let envelope = proxy.call("add", vec![json!(1)]).await.expect("call");
        assert_eq!(envelope.kind, "wrapped:number");
    }
}
