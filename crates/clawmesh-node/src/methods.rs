//! Method dispatch.
//!
//! A mapping from method name to a typed async handler closing over the
//! runtime. Handlers return typed errors; a panic inside a handler is
//! caught and surfaced as `INTERNAL_ERROR` instead of taking down the
//! connection task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

use clawmesh_types::{ErrorCode, MeshError, MeshResult};

/// What a handler learns about the request.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    /// The authenticated peer the request arrived from.
    pub peer_device_id: String,
    pub params: Value,
}

type MethodHandler = Arc<dyn Fn(RequestCtx) -> BoxFuture<'static, MeshResult<Value>> + Send + Sync>;

/// Name → handler table.
#[derive(Default)]
pub struct MethodTable {
    handlers: DashMap<String, MethodHandler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler. A later registration under the same name
    /// replaces the earlier one, which is how a host application
    /// overrides a standard method.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(RequestCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MeshResult<Value>> + Send + 'static,
    {
        self.handlers
            .insert(method.into(), Arc::new(move |ctx| handler(ctx).boxed()));
    }

    /// Run the handler for `method`, catching panics.
    pub async fn dispatch(&self, method: &str, ctx: RequestCtx) -> MeshResult<Value> {
        let Some(handler) = self.handlers.get(method).map(|h| Arc::clone(h.value())) else {
            return Err(MeshError::new(
                ErrorCode::UnknownMethod,
                format!("no handler for {method}"),
            ));
        };
        match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                warn!(method, "handler panicked");
                Err(MeshError::internal(format!("handler for {method} panicked")))
            }
        }
    }

    /// Registered method names.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
