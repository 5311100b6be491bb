//! Route table from method keys to handler chains.
//!
//! Keys are upper-cased method names. MESSAGE and NOTIFY carry a MANSCDP
//! body and are routed on `METHOD-CMDTYPE`, e.g. `MESSAGE-KEEPALIVE`.
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

pub mod context;
pub use context::Context;

/// One step of a handler chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &mut Context);
}

#[async_trait]
impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync,
{
    async fn call(&self, ctx: &mut Context) {
        (self)(ctx).await
    }
}

pub type HandlerRef = Arc<dyn Handler>;

/// Wraps a closure returning a boxed future as a handler.
///
/// ```rust,no_run
/// use gbsip::router::handler;
/// let ok = handler(|ctx| {
///     Box::pin(async move {
///         ctx.string(rsip::StatusCode::OK, "OK").await;
///     })
/// });
/// ```
pub fn handler<F>(f: F) -> HandlerRef
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Route key for `method`, suffixed with the command type when present.
pub fn route_key(method: &str, cmd_type: Option<&str>) -> String {
    match cmd_type {
        Some(cmd_type) => format!("{}-{}", method, cmd_type).to_uppercase(),
        None => method.to_uppercase(),
    }
}

#[derive(Default)]
pub struct Router {
    routes: RwLock<HashMap<String, Vec<HandlerRef>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the chain for `key`, replacing any previous one.
    pub fn add(&self, key: &str, handlers: Vec<HandlerRef>) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_uppercase(), handlers);
    }

    pub fn get(&self, key: &str) -> Option<Vec<HandlerRef>> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key.to_uppercase())
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&key.to_uppercase())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Registers `handlers` for `method` and returns a group for its
    /// command types.
    pub fn group(&self, method: &str, handlers: Vec<HandlerRef>) -> RouteGroup<'_> {
        self.add(method, handlers.clone());
        RouteGroup {
            router: self,
            method: method.to_uppercase(),
            handlers,
        }
    }
}

/// Command-type routes under one method. The group's handlers run ahead
/// of each command's own handlers.
pub struct RouteGroup<'a> {
    router: &'a Router,
    method: String,
    handlers: Vec<HandlerRef>,
}

impl RouteGroup<'_> {
    pub fn handle(&self, cmd_type: &str, handlers: Vec<HandlerRef>) -> &Self {
        let mut chain = self.handlers.clone();
        chain.extend(handlers);
        self.router
            .add(&route_key(&self.method, Some(cmd_type)), chain);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}
