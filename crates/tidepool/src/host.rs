//! Host runtime: owns the authoritative state, accepts connections, pushes
//! the initial sync and every subsequent patch, and exposes per-client
//! call targeting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tidepool_proto::{decode, encode, Message};

use crate::error::RpcError;
use crate::rpc::{
    handler_fn, CallOrigin, ConnectionId, ProcedureHandler, ProcedureRegistry, ProcedureTree,
    RpcEngine, DEFAULT_CALL_TIMEOUT,
};
use crate::state::HostState;
use crate::transport::{Transport, TransportAcceptor, TransportError};

/// Reserved procedure a client calls when its mirror can no longer apply
/// patches; the host answers by re-sending a full sync.
pub const RESYNC_PROCEDURE: &str = "state.resync";

pub struct HostConfig<S> {
    pub initial_state: S,
    pub procedures: ProcedureTree,
    pub call_timeout: Duration,
}

impl<S> HostConfig<S> {
    pub fn new(initial_state: S) -> Self {
        Self {
            initial_state,
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

type CloseHook = Arc<dyn Fn(&ConnectionId) + Send + Sync>;

pub struct Host<S> {
    inner: Arc<HostInner<S>>,
}

impl<S> Clone for Host<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct HostInner<S> {
    state: Mutex<HostState<S>>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    registry: ProcedureRegistry,
    close_hooks: Arc<RwLock<HashMap<u64, CloseHook>>>,
    next_hook_id: AtomicU64,
    call_timeout: Duration,
    acceptors: Mutex<Vec<Arc<dyn TransportAcceptor>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<Message>,
    engine: Arc<RpcEngine>,
    opened_at: Instant,
}

impl<S: Clone + Serialize + Send + 'static> Host<S> {
    pub fn new(config: HostConfig<S>) -> Result<Self, RpcError> {
        let inner = Arc::new(HostInner {
            state: Mutex::new(HostState::new(config.initial_state)?),
            connections: RwLock::new(HashMap::new()),
            registry: ProcedureRegistry::new(),
            close_hooks: Arc::new(RwLock::new(HashMap::new())),
            next_hook_id: AtomicU64::new(0),
            call_timeout: config.call_timeout,
            acceptors: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });
        inner.registry.install(config.procedures)?;
        inner
            .registry
            .register(RESYNC_PROCEDURE, resync_handler(Arc::downgrade(&inner)))?;
        Ok(Self { inner })
    }

    /// Accept connections from `acceptor` until it closes. May be called
    /// with several acceptors; each runs its own accept loop.
    pub fn serve(&self, acceptor: Arc<dyn TransportAcceptor>) {
        let inner = Arc::clone(&self.inner);
        let accept_from = Arc::clone(&acceptor);
        let handle = tokio::spawn(async move {
            loop {
                match accept_from.accept().await {
                    Ok(transport) => HostInner::add_connection(&inner, transport),
                    Err(TransportError::ChannelClosed) => break,
                    Err(err) => {
                        warn!(target: "tidepool::host", error = %err, "accept failed");
                        break;
                    }
                }
            }
        });
        self.inner.acceptors.lock().push(acceptor);
        self.inner.tasks.lock().push(handle);
    }

    /// A clone of the authoritative state.
    pub fn state(&self) -> S {
        self.inner.state.lock().value()
    }

    /// Apply one mutation and broadcast the patch describing it to every
    /// connected client. The whole sequence — recipe, diff, swap,
    /// broadcast enqueue — happens under one lock, so concurrent mutations
    /// never interleave and every client observes patches in mutation
    /// order.
    pub fn set_state(&self, recipe: impl FnOnce(&mut S)) -> Result<(), RpcError> {
        let mut state = self.inner.state.lock();
        let ops = state.mutate(recipe)?;
        if ops.is_empty() {
            return Ok(());
        }
        let connections = self.inner.connections.read();
        debug!(
            target: "tidepool::host",
            ops = ops.len(),
            clients = connections.len(),
            "broadcasting state patch"
        );
        for connection in connections.values() {
            let _ = connection.outbound.send(Message::state_patch(ops.clone()));
        }
        Ok(())
    }

    /// Register a procedure after startup. Existing connections can call
    /// it immediately; the registry is shared, not copied per connection.
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

    /// Run `hook` once per connection teardown until the guard is dropped.
    #[must_use = "dropping the guard unregisters the hook"]
    pub fn on_close(&self, hook: impl Fn(&ConnectionId) + Send + Sync + 'static) -> CloseHookGuard {
        let id = self.inner.next_hook_id.fetch_add(1, Ordering::Relaxed);
        self.inner.close_hooks.write().insert(id, Arc::new(hook));
        CloseHookGuard {
            hooks: Arc::clone(&self.inner.close_hooks),
            id,
        }
    }

    pub fn connected_clients(&self) -> Vec<ConnectionId> {
        self.inner.connections.read().keys().cloned().collect()
    }

    /// How long the identified client has been connected.
    pub fn client_uptime(&self, id: &ConnectionId) -> Option<Duration> {
        self.inner
            .connections
            .read()
            .get(id)
            .map(|connection| connection.opened_at.elapsed())
    }

    /// Call a procedure the identified client registered.
    pub async fn call_client(
        &self,
        id: &ConnectionId,
        path: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.call_client_with(id, path, params, self.inner.call_timeout)
            .await
    }

    pub async fn call_client_with(
        &self,
        id: &ConnectionId,
        path: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let connection = self
            .inner
            .connections
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RpcError::ClientNotFound(id.clone()))?;
        connection.engine.call(path, params, timeout).await
    }

    /// Call the same procedure on every connected client, gathering each
    /// client's result independently.
    pub async fn call_each(
        &self,
        path: &str,
        params: Vec<Value>,
    ) -> Vec<(ConnectionId, Result<Value, RpcError>)> {
        let connections: Vec<Arc<Connection>> =
            self.inner.connections.read().values().cloned().collect();
        let timeout = self.inner.call_timeout;
        join_all(connections.into_iter().map(|connection| {
            let params = params.clone();
            async move {
                let result = connection.engine.call(path, params, timeout).await;
                (connection.id.clone(), result)
            }
        }))
        .await
    }

    /// Tear everything down: stop accepting, drop every connection
    /// (rejecting its pending calls and firing close hooks), and abort the
    /// accept loops.
    pub fn close(&self) {
        for acceptor in self.inner.acceptors.lock().drain(..) {
            acceptor.close();
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let ids: Vec<ConnectionId> = self.inner.connections.read().keys().cloned().collect();
        for id in &ids {
            HostInner::drop_connection(&self.inner, id);
        }
        if !ids.is_empty() {
            info!(target: "tidepool::host", clients = ids.len(), "host closed");
        }
    }

    #[cfg(test)]
    pub(crate) fn close_hook_count(&self) -> usize {
        self.inner.close_hooks.read().len()
    }
}

impl<S: Clone + Serialize + Send + 'static> HostInner<S> {
    fn add_connection(inner: &Arc<Self>, transport: Arc<dyn Transport>) {
        let id = ConnectionId::generate();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let engine = RpcEngine::new(
            outbound_tx.clone(),
            inner.registry.clone(),
            CallOrigin::Client(id.clone()),
        );
        let connection = Arc::new(Connection {
            id: id.clone(),
            transport: Arc::clone(&transport),
            outbound: outbound_tx,
            engine,
            opened_at: Instant::now(),
        });

        let writer_transport = Arc::clone(&transport);
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frame = match encode(&message) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(target: "tidepool::host", error = %err, "dropping unencodable frame");
                        continue;
                    }
                };
                if writer_transport.send(frame).await.is_err() {
                    break;
                }
            }
        });

        // Register and seed under the state lock: a patch broadcast can
        // run strictly before (connection invisible) or strictly after
        // (sync already queued ahead of it), never in between.
        {
            let state = inner.state.lock();
            inner
                .connections
                .write()
                .insert(id.clone(), Arc::clone(&connection));
            let _ = connection
                .outbound
                .send(Message::state_sync(state.image().clone()));
        }
        info!(target: "tidepool::host", connection = %id, "client connected");

        let pump_inner = Arc::clone(inner);
        tokio::spawn(async move {
            loop {
                match connection.transport.recv().await {
                    Ok(frame) => match decode(&frame) {
                        Ok(message) if message.is_rpc() => {
                            connection.engine.handle_message(message)
                        }
                        Ok(message) => warn!(
                            target: "tidepool::host",
                            connection = %connection.id,
                            tag = message.tag(),
                            "client sent a host-only frame"
                        ),
                        Err(err) => warn!(
                            target: "tidepool::host",
                            connection = %connection.id,
                            error = %err,
                            "dropping undecodable frame"
                        ),
                    },
                    Err(_) => break,
                }
            }
            HostInner::drop_connection(&pump_inner, &connection.id);
            writer.abort();
        });
    }

    /// Idempotent teardown: the map removal is the guard, so a transport
    /// that signals close twice still tears down once.
    fn drop_connection(inner: &Arc<Self>, id: &ConnectionId) {
        let removed = inner.connections.write().remove(id);
        let Some(connection) = removed else {
            return;
        };
        connection.engine.cleanup();
        connection.transport.close();
        let hooks: Vec<CloseHook> = inner.close_hooks.read().values().cloned().collect();
        for hook in hooks {
            hook(id);
        }
        info!(target: "tidepool::host", connection = %id, "client disconnected");
    }

    /// Re-send a full sync to one client, serialized against mutations.
    fn resync(&self, id: &ConnectionId) -> bool {
        let state = self.state.lock();
        let connections = self.connections.read();
        match connections.get(id) {
            Some(connection) => {
                let _ = connection
                    .outbound
                    .send(Message::state_sync(state.image().clone()));
                true
            }
            None => false,
        }
    }
}

fn resync_handler<S: Clone + Serialize + Send + 'static>(
    inner: Weak<HostInner<S>>,
) -> Arc<dyn ProcedureHandler> {
    handler_fn(move |_params, origin| {
        let inner = inner.clone();
        async move {
            let CallOrigin::Client(id) = origin else {
                anyhow::bail!("resync requests only originate from clients");
            };
            let Some(inner) = inner.upgrade() else {
                anyhow::bail!("host is shutting down");
            };
            debug!(target: "tidepool::host", connection = %id, "client requested a full resync");
            if !inner.resync(&id) {
                anyhow::bail!("connection '{id}' is gone");
            }
            Ok(Value::Null)
        }
    })
}

/// Unregisters its close hook when dropped.
pub struct CloseHookGuard {
    hooks: Arc<RwLock<HashMap<u64, CloseHook>>>,
    id: u64,
}

impl Drop for CloseHookGuard {
    fn drop(&mut self) {
        self.hooks.write().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_the_guard_unregisters_the_hook() {
        let host = Host::new(HostConfig::new(serde_json::json!({}))).expect("host");
        let guard = host.on_close(|_id| {});
        assert_eq!(host.close_hook_count(), 1);
        drop(guard);
        assert_eq!(host.close_hook_count(), 0);
    }

    #[tokio::test]
    async fn the_resync_procedure_is_reserved_at_construction() {
        let host = Host::new(HostConfig::new(serde_json::json!({}))).expect("host");
        assert!(host.has_procedure(RESYNC_PROCEDURE));
        let err = host
            .register_procedure(
                RESYNC_PROCEDURE,
                handler_fn(|_params, _origin| async move { Ok(Value::Null) }),
            )
            .expect_err("reserved path");
        assert!(matches!(err, RpcError::ProcedureAlreadyRegistered(_)));
    }
}
