//! Client runtime: a read-only mirror of the host's state plus the
//! call/answer surface for procedures in both directions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tidepool_proto::{decode, encode, Message};

use crate::error::RpcError;
use crate::host::RESYNC_PROCEDURE;
use crate::rpc::{
    CallOrigin, ProcedureHandler, ProcedureRegistry, ProcedureTree, RpcEngine,
    DEFAULT_CALL_TIMEOUT,
};
use crate::state::{Mirror, PatchOutcome};
use crate::transport::Transport;

pub struct ClientConfig<S> {
    pub fallback_state: S,
    pub procedures: ProcedureTree,
    pub call_timeout: Duration,
}

impl<S> ClientConfig<S> {
    pub fn new(fallback_state: S) -> Self {
        Self {
            fallback_state,
            procedures: ProcedureTree::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn procedures(mut self, procedures: ProcedureTree) -> Self {
        self.procedures = procedures;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

pub struct Client<S> {
    inner: Arc<ClientInner<S>>,
}

impl<S> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<S> {
    mirror: Mirror<S>,
    registry: ProcedureRegistry,
    engine: Arc<RpcEngine>,
    transport: Arc<dyn Transport>,
    connected: AtomicBool,
    call_timeout: Duration,
}

impl<S> Client<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Wire a client over an established transport. The procedure tree is
    /// installed before the receive pump starts, so the host can never
    /// observe a half-configured client.
    pub fn connect(
        config: ClientConfig<S>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RpcError> {
        let registry = ProcedureRegistry::new();
        registry.install(config.procedures)?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let engine = RpcEngine::new(outbound_tx, registry.clone(), CallOrigin::Host);

        let inner = Arc::new(ClientInner {
            mirror: Mirror::new(config.fallback_state)?,
            registry,
            engine,
            transport: Arc::clone(&transport),
            connected: AtomicBool::new(true),
            call_timeout: config.call_timeout,
        });

        let writer_transport = Arc::clone(&transport);
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frame = match encode(&message) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(target: "tidepool::client", error = %err, "dropping unencodable frame");
                        continue;
                    }
                };
                if writer_transport.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let pump_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                match pump_inner.transport.recv().await {
                    Ok(frame) => match decode(&frame) {
                        Ok(message) => pump_inner.handle_frame(message),
                        Err(err) => warn!(
                            target: "tidepool::client",
                            error = %err,
                            "dropping undecodable frame"
                        ),
                    },
                    Err(_) => break,
                }
            }
            pump_inner.connected.store(false, Ordering::SeqCst);
            pump_inner.engine.cleanup();
            debug!(target: "tidepool::client", "server connection closed");
            writer.abort();
        });

        Ok(Self { inner })
    }

    /// The current mirror value: the fallback until the first sync, then
    /// whatever the host has replicated.
    pub fn state(&self) -> S {
        self.inner.mirror.value()
    }

    /// False until the first sync, and while the mirror is frozen awaiting
    /// recovery from a patch it could not apply.
    pub fn is_synced(&self) -> bool {
        self.inner.mirror.is_synced()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && self.inner.transport.is_open()
    }

    /// Call a host-registered procedure.
    pub async fn call(&self, path: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.call_with(path, params, self.inner.call_timeout).await
    }

    pub async fn call_with(
        &self,
        path: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::ServerUnavailable);
        }
        self.inner.engine.call(path, params, timeout).await
    }

    /// Call and deserialize the return value.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(path, params).await?;
        serde_json::from_value(value).map_err(RpcError::ReturnType)
    }

    /// Register a procedure the host may call. Takes effect immediately;
    /// the registry is shared with the live correlation engine.
    pub fn register_procedure(
        &self,
        path: &str,
        handler: Arc<dyn ProcedureHandler>,
    ) -> Result<(), RpcError> {
        self.inner.registry.register(path, handler)
    }

    pub fn remove_procedure(&self, path: &str) -> Result<(), RpcError> {
        self.inner.registry.remove(path)
    }

    pub fn has_procedure(&self, path: &str) -> bool {
        self.inner.registry.contains(path)
    }

    pub fn close(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.transport.close();
    }
}

impl<S> ClientInner<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn handle_frame(self: &Arc<Self>, message: Message) {
        match message {
            Message::StateSync { state } => {
                // a snapshot that does not deserialize is a schema
                // mismatch, not a missed message; resyncing would fetch
                // the same bytes again
                if let Err(err) = self.mirror.apply_sync(state) {
                    warn!(target: "tidepool::client", error = %err, "state sync did not apply");
                }
            }
            Message::StatePatch { patch } => match self.mirror.apply_patch_ops(&patch) {
                Ok(PatchOutcome::Applied) => {}
                Ok(PatchOutcome::AwaitingSync) => {
                    debug!(target: "tidepool::client", "dropping patch while awaiting sync")
                }
                Err(err) => {
                    warn!(
                        target: "tidepool::client",
                        error = %err,
                        "patch did not apply; requesting a full resync"
                    );
                    self.request_resync();
                }
            },
            rpc => self.engine.handle_message(rpc),
        }
    }

    /// Protocol-violation recovery: ask the host for a fresh snapshot. The
    /// mirror stays frozen until it arrives.
    fn request_resync(self: &Arc<Self>) {
        let engine = Arc::clone(&self.engine);
        let timeout = self.call_timeout;
        tokio::spawn(async move {
            if let Err(err) = engine.call(RESYNC_PROCEDURE, vec![], timeout).await {
                warn!(target: "tidepool::client", error = %err, "resync request failed");
            }
        });
    }
}
