//! The transport/RPC collaborator seam.
//!
//! Everything about framing, serialization and the actual network medium
//! lives behind these traits. The connection manager and orchestrator only
//! rely on the capabilities below: point-to-point calls, named broadcast
//! channels, method registration, and link lifecycle events.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::discovery::PeerAddr;
use crate::error::Result;

/// Arguments delivered to a registered method handler.
///
/// The wire convention is dual: an array payload is spread as positional
/// arguments, any other payload is passed through as a single parameter.
/// The shape is resolved once, when the payload arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArgs {
    /// A positional argument sequence (the wire payload was an array).
    Positional(Vec<Value>),
    /// A single opaque parameter (any non-array payload).
    Keyed(Value),
}

impl CallArgs {
    /// Resolve the calling convention from a raw wire payload.
    pub fn from_wire(payload: Value) -> Self {
        match payload {
            Value::Array(values) => Self::Positional(values),
            other => Self::Keyed(other),
        }
    }

    /// Collapse to a single parameter: the first positional argument, or
    /// the keyed value.
    pub fn into_single(self) -> Value {
        match self {
            Self::Positional(mut values) => {
                if values.is_empty() {
                    Value::Null
                } else {
                    values.swap_remove(0)
                }
            }
            Self::Keyed(value) => value,
        }
    }
}

/// Future returned by a method handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// A registered method handler on a hosting endpoint.
pub type MethodHandler = Arc<dyn Fn(CallArgs) -> HandlerFuture + Send + Sync>;

/// Stream of payloads delivered on one broadcast-channel subscription.
pub type ChannelStream = BoxStream<'static, Value>;

/// Stream of lifecycle events for one link.
pub type LinkEvents = BoxStream<'static, LinkEvent>;

/// Lifecycle events emitted by a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The transport connection is established.
    Open,
    /// The transport connection closed.
    Closed {
        /// Transport-level close code.
        code: i64,
    },
    /// A transport-level error. Not terminal by itself.
    Error {
        /// Error description.
        message: String,
    },
}

/// An outbound point-to-point RPC connection to one peer.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Stable identity of this connection within the process.
    fn id(&self) -> u64;

    /// Invoke a remote method with positional arguments.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    /// Subscribe to a named broadcast channel on the remote endpoint.
    ///
    /// The stream ends when the link closes. Delivery is best-effort.
    fn subscribe(&self, channel: &str) -> ChannelStream;

    /// Lifecycle events for this link.
    ///
    /// A freshly opened link yields [`LinkEvent::Open`] once established;
    /// the stream ends at or after [`LinkEvent::Closed`]. A subscriber that
    /// attaches after the link opened still observes the `Open` event.
    fn lifecycle(&self) -> LinkEvents;

    /// Force-close the transport connection. Idempotent.
    fn close(&self);
}

/// Shared handle to a link.
pub type SharedLink = Arc<dyn Link>;

/// The hosting side of the transport: method registration and broadcast.
pub trait Endpoint: Send + Sync + 'static {
    /// Register (or replace) a method handler.
    fn register(&self, method: &str, handler: MethodHandler);

    /// Declare a named broadcast channel.
    fn define_channel(&self, channel: &str);

    /// Broadcast a payload to every current subscriber of a channel.
    ///
    /// At-most-once, unordered across receivers, unacknowledged.
    fn broadcast(&self, channel: &str, payload: Value);
}

/// Shared handle to a hosting endpoint.
pub type SharedEndpoint = Arc<dyn Endpoint>;

/// Opens links to peers by address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link to a peer.
    ///
    /// The returned link may still be establishing; its lifecycle stream
    /// reports when it opens or fails.
    async fn open(&self, peer: &PeerAddr) -> Result<SharedLink>;
}

/// Shared handle to a connector.
pub type SharedConnector = Arc<dyn Connector>;

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn array_payloads_spread_positionally() {
        let args = CallArgs::from_wire(json!([1, "two"]));
        assert_eq!(args, CallArgs::Positional(vec![json!(1), json!("two")]));
        assert_eq!(args.into_single(), json!(1));
    }

    #[test]
    fn non_array_payloads_pass_through_keyed() {
        let args = CallArgs::from_wire(json!({"token": "t"}));
        assert_eq!(args, CallArgs::Keyed(json!({"token": "t"})));
        assert_eq!(args.into_single(), json!({"token": "t"}));
    }

    #[test]
    fn empty_positional_collapses_to_null() {
        assert_eq!(CallArgs::from_wire(json!([])).into_single(), json!(null));
    }
}
