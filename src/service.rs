//! Local services: named method collections exposed to the mesh.
//!
//! A service owns a name, a type tag and a set of method handlers. It is
//! registered with a [`Node`](crate::server::Node) which attaches it to the
//! hosting endpoint; from then on its descriptor is visible to peers and
//! its methods are callable as `"{service}.{method}"`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::trace;

use crate::error::Result;
use crate::protocol::{value_kind, Envelope, ServiceDescriptor, SERVICE_EVENT_CHANNEL};
use crate::transport::{CallArgs, MethodHandler, SharedEndpoint};

/// Default type tag for services.
const SERVICE_KIND: &str = "service";

/// A named set of remotely callable methods.
///
/// Cheap to clone; clones share the method table and attached endpoints,
/// so application code can keep a handle for [`emit`](Service::emit) after
/// handing the service to a node.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    name: String,
    kind: String,
    methods: Mutex<HashMap<String, MethodHandler>>,
    endpoints: Mutex<Vec<SharedEndpoint>>,
}

impl Service {
    /// Create a service with the default `"service"` type tag.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self::with_kind(name, SERVICE_KIND)
    }

    /// Create a service with a custom type tag.
    pub fn with_kind<N: Into<String>, K: Into<String>>(name: N, kind: K) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                kind: kind.into(),
                methods: Mutex::new(HashMap::new()),
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Recomputed snapshot of the service's published shape.
    pub fn descriptor(&self) -> ServiceDescriptor {
        let mut methods: Vec<String> = self
            .inner
            .methods
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        methods.sort();
        ServiceDescriptor {
            kind: self.inner.kind.clone(),
            name: self.inner.name.clone(),
            methods,
        }
    }

    /// Register a method. The envelope kind is inferred from the result's
    /// runtime category. Re-registering a name overwrites the handler.
    pub fn register<N, F, Fut>(&self, method: N, handler: F) -> &Self
    where
        N: Into<String>,
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.install(method.into(), handler, None);
        self
    }

    /// Register a method with an explicit envelope kind override.
    pub fn register_with_kind<N, F, Fut>(&self, method: N, handler: F, kind: &str) -> &Self
    where
        N: Into<String>,
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.install(method.into(), handler, Some(kind.to_string()));
        self
    }

    fn install<F, Fut>(&self, method: String, handler: F, kind: Option<String>)
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: MethodHandler = Arc::new(move |args: CallArgs| {
            let handler = Arc::clone(&handler);
            let kind = kind.clone();
            Box::pin(async move {
                let result = handler(args).await?;
                let kind = kind.unwrap_or_else(|| value_kind(&result).to_string());
                Ok(serde_json::to_value(Envelope { kind, data: result })?)
            })
        });
        self.inner
            .methods
            .lock()
            .expect("lock poisoned")
            .insert(method, wrapped);
    }

    /// Attach the service to a hosting endpoint.
    ///
    /// Registers every current method as `"{service}.{method}"` and adds
    /// the endpoint to the event fan-out set. A service can be attached to
    /// several endpoints (multi-homing).
    pub fn attach(&self, endpoint: SharedEndpoint) {
        {
            let methods = self.inner.methods.lock().expect("lock poisoned");
            for (method, handler) in methods.iter() {
                let target = format!("{}.{}", self.inner.name, method);
                endpoint.register(&target, Arc::clone(handler));
            }
        }
        self.inner
            .endpoints
            .lock()
            .expect("lock poisoned")
            .push(endpoint);
    }

    /// Broadcast an application event to every attached endpoint.
    ///
    /// No-op while unattached. At-most-once, unordered across endpoints,
    /// unacknowledged.
    pub fn emit<N: Into<String>>(&self, event: N, data: Value) {
        let endpoints: Vec<SharedEndpoint> = self
            .inner
            .endpoints
            .lock()
            .expect("lock poisoned")
            .clone();
        if endpoints.is_empty() {
            return;
        }
        let event = event.into();
        trace!(service = %self.inner.name, event = %event, "emitting service event");
        let payload = json!({ "name": event, "data": data });
        for endpoint in endpoints {
            endpoint.broadcast(SERVICE_EVENT_CHANNEL, payload.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn envelope_of(service: &Service, method: &str, args: CallArgs) -> Envelope {
        let handler = service
            .inner
            .methods
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .expect("method registered");
        let raw = handler(args).await.expect("handler failed");
        serde_json::from_value(raw).expect("envelope shape")
    }

    #[tokio::test]
    async fn positional_arguments_are_spread() {
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

        let envelope = envelope_of(
            &service,
            "add",
            CallArgs::Positional(vec![json!(2), json!(3)]),
        )
        .await;
        assert_eq!(envelope.kind, "number");
        assert_eq!(envelope.data, json!(5));
    }

    #[tokio::test]
    async fn keyed_parameter_passes_through() {
        let service = Service::new("echo");
        service.register("echo", |args: CallArgs| async move {
            Ok(args.into_single())
        });

        let envelope = envelope_of(
            &service,
            "echo",
            CallArgs::Keyed(json!({"greeting": "hello"})),
        )
        .await;
        assert_eq!(envelope.kind, "object");
        assert_eq!(envelope.data, json!({"greeting": "hello"}));
    }

    #[tokio::test]
    async fn explicit_kind_overrides_inference() {
        let service = Service::new("weather");
        service.register_with_kind(
            "reading",
            |_args| async move { Ok(json!(21.5)) },
            "celsius",
        );

        let envelope = envelope_of(&service, "reading", CallArgs::Positional(vec![])).await;
        assert_eq!(envelope.kind, "celsius");
        assert_eq!(envelope.data, json!(21.5));
    }

    #[tokio::test]
    async fn descriptor_recomputes_and_reregistration_overwrites() {
        let service = Service::with_kind("store", "kv");
        service.register("get", |_args| async move { Ok(json!(null)) });
        assert_eq!(service.descriptor().methods, vec!["get"]);

        service.register("put", |_args| async move { Ok(json!(true)) });
        let descriptor = service.descriptor();
        assert_eq!(descriptor.kind, "kv");
        assert_eq!(descriptor.methods, vec!["get", "put"]);

        service.register("get", |_args| async move { Ok(json!("replaced")) });
        assert_eq!(service.descriptor().methods, vec!["get", "put"]);
        let envelope = envelope_of(&service, "get", CallArgs::Positional(vec![])).await;
        assert_eq!(envelope.data, json!("replaced"));
    }

    #[test]
    fn emit_without_endpoints_is_a_noop() {
        let service = Service::new("quiet");
        service.emit("tick", json!(1));
    }
}
