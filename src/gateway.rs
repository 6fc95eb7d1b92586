use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::{MeshError, Result};

/// A remote call handler. The first argument is always the identity of the
/// calling peer, prepended by the gateway before the original arguments.
pub type RemoteHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
struct RemoteMethod {
    handler: RemoteHandler,
    secure: bool,
}

/// Registry mapping bare method names to handlers.
///
/// Each subsystem registers the methods it exposes; the registry is built
/// once at startup and injected into every session gateway.
#[derive(Default)]
pub struct RemoteRegistry {
    methods: HashMap<String, RemoteMethod>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secured method. Calls are refused unless the session is
    /// authenticated.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.insert(name, handler, true);
    }

    /// Register a method callable before authentication.
    pub fn register_open<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.insert(name, handler, false);
    }

    fn insert<F, Fut>(&mut self, name: &str, handler: F, secure: bool)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RemoteHandler = Arc::new(move |caller, args| handler(caller, args).boxed());
        self.methods
            .insert(name.to_string(), RemoteMethod { handler, secure });
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }
}

/// Per-session facade over a [`RemoteRegistry`].
///
/// Resolves incoming call names, injects the caller's identity as the first
/// argument and enforces the per-method secure flag. Holds no state beyond
/// the registry, the peer identity and the authenticated flag.
pub struct SessionGateway {
    registry: Arc<RemoteRegistry>,
    peer: String,
    authenticated: AtomicBool,
}

impl SessionGateway {
    /// A gateway for a session that has not yet authenticated.
    pub fn new(registry: Arc<RemoteRegistry>, peer: impl Into<String>) -> Self {
        Self {
            registry,
            peer: peer.into(),
            authenticated: AtomicBool::new(false),
        }
    }

    /// A gateway for a session whose credentials were already verified.
    pub fn authenticated(registry: Arc<RemoteRegistry>, peer: impl Into<String>) -> Self {
        let gateway = Self::new(registry, peer);
        gateway.set_authenticated();
        gateway
    }

    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Resolve and invoke a remote method.
    ///
    /// Unknown names fail loudly; secured methods on an unauthenticated
    /// session are refused with an explicit unauthorized error, which is
    /// always distinguishable from a handler successfully returning null.
    pub async fn dispatch(&self, method: &str, args: Value) -> Result<Value> {
        let resolved = match self.registry.methods.get(method) {
            Some(m) => m.clone(),
            None => {
                tracing::error!(
                    peer = %self.peer,
                    method,
                    "call to unregistered remote method"
                );
                return Err(MeshError::UnknownMethod(method.to_string()));
            }
        };

        if resolved.secure && !self.is_authenticated() {
            tracing::error!(
                peer = %self.peer,
                method,
                "secured method refused for unauthenticated session"
            );
            return Err(MeshError::Unauthorized(method.to_string()));
        }

        (resolved.handler)(self.peer.clone(), args).await
    }
}
