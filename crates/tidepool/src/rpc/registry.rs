use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::error::RpcError;

/// Identifies one live client connection. Host-generated, unique for the
/// lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which peer invoked a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOrigin {
    /// The host called a client-registered procedure.
    Host,
    /// The identified client called a host-registered procedure.
    Client(ConnectionId),
}

/// An async procedure body. Handlers signal failure by returning `Err`;
/// the error crosses the wire as a `handler_failed` exception.
#[async_trait]
pub trait ProcedureHandler: Send + Sync {
    async fn invoke(&self, params: Vec<Value>, origin: CallOrigin) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ProcedureHandler for FnHandler<F>
where
    F: Fn(Vec<Value>, CallOrigin) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn invoke(&self, params: Vec<Value>, origin: CallOrigin) -> anyhow::Result<Value> {
        (self.0)(params, origin).await
    }
}

/// Wrap an async closure as a [`ProcedureHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ProcedureHandler>
where
    F: Fn(Vec<Value>, CallOrigin) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Flattened dot-path map of procedure handlers, shared between the
/// runtime and every live connection's correlation engine. A path holds at
/// most one handler at a time.
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ProcedureHandler>>>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &str, handler: Arc<dyn ProcedureHandler>) -> Result<(), RpcError> {
        let mut map = self.inner.write();
        if map.contains_key(path) {
            return Err(RpcError::ProcedureAlreadyRegistered(path.to_string()));
        }
        map.insert(path.to_string(), handler);
        Ok(())
    }

    /// Removing a path nobody registered is an error, not a no-op: a typo
    /// here is configuration damage and should surface at the call site.
    pub fn remove(&self, path: &str) -> Result<(), RpcError> {
        self.inner
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| RpcError::ProcedureNotRegistered(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.read().contains_key(path)
    }

    pub(crate) fn get(&self, path: &str) -> Option<Arc<dyn ProcedureHandler>> {
        self.inner.read().get(path).cloned()
    }

    pub(crate) fn install(&self, tree: ProcedureTree) -> Result<(), RpcError> {
        for (path, handler) in tree.entries {
            self.register(&path, handler)?;
        }
        Ok(())
    }
}

/// Nested procedure groups, flattened to dot-delimited paths when the
/// runtime installs them. Paths under the `state.` prefix are reserved for
/// the runtime itself.
#[derive(Default)]
pub struct ProcedureTree {
    entries: Vec<(String, Arc<dyn ProcedureHandler>)>,
}

impl ProcedureTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn procedure(mut self, name: &str, handler: Arc<dyn ProcedureHandler>) -> Self {
        assert!(
            !name.contains('.'),
            "procedure segment '{name}' must not contain '.'; nest with group()"
        );
        self.entries.push((name.to_string(), handler));
        self
    }

    pub fn group(mut self, name: &str, tree: ProcedureTree) -> Self {
        assert!(
            !name.contains('.'),
            "group segment '{name}' must not contain '.'; nest with group()"
        );
        for (path, handler) in tree.entries {
            self.entries.push((format!("{name}.{path}"), handler));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(value: Value) -> Arc<dyn ProcedureHandler> {
        handler_fn(move |_params, _origin| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[tokio::test]
    async fn registering_an_occupied_path_fails_synchronously() {
        let registry = ProcedureRegistry::new();
        registry
            .register("increment", constant(json!(1)))
            .expect("first registration");
        let err = registry
            .register("increment", constant(json!(2)))
            .expect_err("duplicate registration");
        assert!(matches!(err, RpcError::ProcedureAlreadyRegistered(path) if path == "increment"));
    }

    #[tokio::test]
    async fn removal_frees_the_path_for_a_new_handler() {
        let registry = ProcedureRegistry::new();
        registry
            .register("value", constant(json!("old")))
            .expect("register old");
        registry.remove("value").expect("remove");
        registry
            .register("value", constant(json!("new")))
            .expect("register new");

        let handler = registry.get("value").expect("handler present");
        let result = handler
            .invoke(vec![], CallOrigin::Host)
            .await
            .expect("invoke");
        assert_eq!(result, json!("new"));
    }

    #[test]
    fn removing_an_unregistered_path_is_an_error() {
        let registry = ProcedureRegistry::new();
        let err = registry.remove("ghost").expect_err("remove unregistered");
        assert!(matches!(err, RpcError::ProcedureNotRegistered(path) if path == "ghost"));
    }

    #[test]
    fn trees_flatten_to_dot_paths() {
        let registry = ProcedureRegistry::new();
        let tree = ProcedureTree::new().procedure("ping", constant(json!(null))).group(
            "workspace",
            ProcedureTree::new()
                .procedure("open", constant(json!(null)))
                .group(
                    "tabs",
                    ProcedureTree::new().procedure("close", constant(json!(null))),
                ),
        );
        registry.install(tree).expect("install");
        assert!(registry.contains("ping"));
        assert!(registry.contains("workspace.open"));
        assert!(registry.contains("workspace.tabs.close"));
        assert!(!registry.contains("workspace"));
    }
}
