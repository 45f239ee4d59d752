//! Provider invocation
//!
//! Calls a provider, measures wall-clock time around the call, and turns
//! returned errors and panics into error-shaped payloads so nothing a
//! provider does can escape the dispatcher.

use crate::errors::{EngineError, ErrorKind};
use crate::tools::normalizer::normalize;
use crate::tools::registry::ProviderRef;
use crate::tools::types::{fields, ToolResult};
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

/// Raw provider output plus the time it took
#[derive(Debug, Clone)]
pub struct Invocation {
    pub raw: Value,
    pub elapsed: Duration,
}

/// Invoke a provider once, never failing
pub async fn invoke(provider: &ProviderRef, args: Value) -> Invocation {
    let start = Instant::now();
    let outcome = AssertUnwindSafe(provider.execute(args)).catch_unwind().await;
    let elapsed = start.elapsed();

    let raw = match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            tracing::debug!(tool = %provider.name(), error = %err, "Provider returned an error");
            error_payload(&err)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(tool = %provider.name(), panic = %message, "Provider panicked");
            json!({
                fields::ERROR: format!("Provider panicked: {}", message),
                fields::STATUS: "error",
                fields::ERROR_KIND: ErrorKind::ProviderError.as_str(),
            })
        }
    };

    Invocation { raw, elapsed }
}

/// Invoke and normalize
pub async fn run(provider: &ProviderRef, args: Value) -> ToolResult {
    let invocation = invoke(provider, args).await;
    let schema = provider.schema();
    normalize(
        invocation.raw,
        &schema.name,
        schema.category,
        invocation.elapsed,
    )
}

/// Raw payload describing a provider error
pub fn error_payload(err: &EngineError) -> Value {
    let status = match err {
        EngineError::ProcessTimeout { .. } => "timeout",
        _ => "error",
    };
    json!({
        fields::ERROR: err.to_string(),
        fields::STATUS: status,
        fields::ERROR_KIND: err.kind().as_str(),
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::provider::FnProvider;
    use crate::tools::types::{ToolCategory, ToolSchema};
    use std::sync::Arc;

    fn provider<F, Fut>(func: F) -> ProviderRef
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = crate::errors::Result<Value>> + Send + 'static,
    {
        Arc::new(FnProvider::new(
            ToolSchema::new("stub", "stub", json!({}), true).with_category(ToolCategory::General),
            func,
        ))
    }

    #[tokio::test]
    async fn test_invoke_passes_value_through() {
        let p = provider(|args| async move { Ok(json!({"echo": args})) });
        let invocation = invoke(&p, json!(1)).await;
        assert_eq!(invocation.raw["echo"], 1);
    }

    #[tokio::test]
    async fn test_provider_error_becomes_payload() {
        let p = provider(|_| async { Err(EngineError::Transient("service unavailable".into())) });
        let result = run(&p, json!({})).await;

        assert!(!result.success());
        assert!(result.verified());
        assert_eq!(result.status(), "error");
        assert_eq!(result.error_kind(), Some("transient_error"));
        assert!(result.error().unwrap().contains("service unavailable"));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let p = provider(|_| async {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        let result = run(&p, json!({})).await;

        assert!(!result.success());
        assert_eq!(result.error_kind(), Some("provider_error"));
        assert!(result.error().unwrap().contains("kaboom"));
    }

    #[test]
    fn test_timeout_error_payload_status() {
        let payload = error_payload(&EngineError::ProcessTimeout { timeout_secs: 3 });
        assert_eq!(payload["status"], "timeout");
        assert_eq!(payload["error_kind"], "process_timeout");
    }
}
