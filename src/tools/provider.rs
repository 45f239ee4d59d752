//! Capability provider seam
//!
//! A provider is one named unit of functionality: a schema plus a single
//! execute function. The engine only ever talks to providers through this
//! trait.

use crate::errors::Result;
use crate::tools::types::ToolSchema;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// A named, schema-described unit the engine can invoke
#[async_trait]
pub trait Provider: Send + Sync {
    /// Immutable description used for lookup, policy and normalization
    fn schema(&self) -> &ToolSchema;

    /// Run the capability. The returned value may have any shape; the
    /// normalizer maps it onto the result contract.
    async fn execute(&self, args: Value) -> Result<Value>;

    fn name(&self) -> &str {
        &self.schema().name
    }
}

type ExecuteFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// Provider backed by a closure
///
/// ```ignore
/// let echo = FnProvider::new(schema, |args| async move { Ok(args) });
/// ```
pub struct FnProvider {
    schema: ToolSchema,
    func: Arc<ExecuteFn>,
}

impl FnProvider {
    pub fn new<F, Fut>(schema: ToolSchema, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            schema,
            func: Arc::new(move |args| Box::pin(func(args))),
        }
    }
}

impl std::fmt::Debug for FnProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProvider")
            .field("name", &self.schema.name)
            .finish()
    }
}

#[async_trait]
impl Provider for FnProvider {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        (self.func)(args).await
    }
}
