//! RPC correlation: match asynchronous responses back to the calls that
//! requested them, dispatch inbound calls to registered handlers, and make
//! sure every call settles exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use tidepool_proto::{Message, WireError};

use crate::error::RpcError;

mod registry;

pub use registry::{
    handler_fn, CallOrigin, ConnectionId, ProcedureHandler, ProcedureRegistry, ProcedureTree,
};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// One peer link's correlation state. The host builds one engine per
/// client connection (all sharing the host registry); a client builds one
/// for its single link to the host.
pub(crate) struct RpcEngine {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, WireError>>>>,
    registry: ProcedureRegistry,
    origin: CallOrigin,
}

impl RpcEngine {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<Message>,
        registry: ProcedureRegistry,
        origin: CallOrigin,
    ) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            registry,
            origin,
        })
    }

    /// Issue a call and wait for its settlement. Fails with
    /// `ConnectionLost` when the timeout elapses or the link dies first;
    /// either way the pending entry is gone afterwards.
    pub(crate) async fn call(
        &self,
        path: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let call_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id.clone(), tx);

        let frame = Message::rpc_call(call_id.clone(), path, params);
        if self.outbound.send(frame).is_err() {
            self.pending.lock().remove(&call_id);
            return Err(RpcError::ConnectionLost);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(wire))) => Err(RpcError::from_wire(wire)),
            // sender dropped: the engine was cleaned up under us
            Ok(Err(_)) => Err(RpcError::ConnectionLost),
            Err(_) => {
                self.pending.lock().remove(&call_id);
                debug!(target: "tidepool::rpc", %call_id, path, "call timed out");
                Err(RpcError::ConnectionLost)
            }
        }
    }

    /// Route one inbound rpc frame. Calls are dispatched on their own task
    /// so a suspended handler never blocks settlement of other traffic on
    /// this link; a handler may therefore call back toward its caller and
    /// await the response.
    pub(crate) fn handle_message(self: &Arc<Self>, message: Message) {
        match message {
            Message::RpcCall {
                call_id,
                path,
                params,
            } => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.dispatch_call(call_id, path, params).await;
                });
            }
            Message::RpcReturn { call_id, value } => self.settle(&call_id, Ok(value)),
            Message::RpcException { call_id, error } => self.settle(&call_id, Err(error)),
            other => {
                warn!(target: "tidepool::rpc", tag = other.tag(), "non-rpc frame routed to engine");
            }
        }
    }

    /// Invoke the handler for one inbound call and send exactly one reply.
    async fn dispatch_call(&self, call_id: String, path: String, params: Vec<Value>) {
        let reply = match self.registry.get(&path) {
            None => {
                debug!(target: "tidepool::rpc", %path, "call to unregistered procedure");
                Message::rpc_exception(call_id, WireError::procedure_not_registered(&path))
            }
            Some(handler) => match handler.invoke(params, self.origin.clone()).await {
                Ok(value) => Message::rpc_return(call_id, value),
                Err(error) => Message::rpc_exception(call_id, wire_from_handler_error(&error)),
            },
        };
        if self.outbound.send(reply).is_err() {
            debug!(target: "tidepool::rpc", "link closed before reply could be sent");
        }
    }

    fn settle(&self, call_id: &str, outcome: Result<Value, WireError>) {
        let sender = self.pending.lock().remove(call_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            // late, duplicate, or never-issued id: drop it
            None => debug!(target: "tidepool::rpc", call_id, "dropping response for unknown call"),
        }
    }

    /// Reject every still-pending call with `ConnectionLost`. Called once
    /// when the owning connection is destroyed.
    pub(crate) fn cleanup(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(
                target: "tidepool::rpc",
                count = drained.len(),
                "rejecting pending calls for a dead link"
            );
        }
        // dropping the senders fails every waiting caller
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }
}

fn wire_from_handler_error(error: &anyhow::Error) -> WireError {
    let mut wire = WireError::handler_failed("HandlerError", format!("{error:#}"));
    let chain: Vec<Value> = error
        .chain()
        .map(|cause| Value::String(cause.to_string()))
        .collect();
    if chain.len() > 1 {
        wire.details.insert("chain".to_string(), Value::Array(chain));
    }
    wire
}
