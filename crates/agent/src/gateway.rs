use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use cartwheel_core::domain::tool::{ToolCall, ToolKind, ToolOutcome};

use crate::cache::TtlCache;
use crate::health::HealthMonitor;
use crate::retry::{run_with_retry, RetryClass, RetryError, RetryPolicy};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend request timed out")]
    Timeout,
    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("backend transport failure: {0}")]
    Transport(String),
}

impl RetryClass for BackendError {
    fn retryable(&self, policy: &RetryPolicy) -> bool {
        match self {
            Self::Timeout => true,
            Self::Status { status, .. } => policy.is_retryable_status(*status),
            Self::Transport(_) => false,
        }
    }
}

/// The fixed set of REST-mapping tool implementations. Pure field-mapping
/// CRUD; all orchestration semantics stay out of implementors.
#[async_trait]
pub trait CommerceBackend: Send + Sync {
    async fn call(
        &self,
        tool: ToolKind,
        arguments: &Value,
        access_token: Option<&str>,
    ) -> Result<Value, BackendError>;
}

/// Uniform call surface over the tool catalog: every call is wrapped in the
/// retry executor, cacheable reads pass through the TTL cache, and every
/// outcome feeds the health monitor. Tool semantics (chaining, correction,
/// cart resolution) live in the orchestrator, not here.
pub struct ToolGateway {
    backend: Arc<dyn CommerceBackend>,
    cache: TtlCache,
    health: Arc<HealthMonitor>,
    retry: RetryPolicy,
}

impl ToolGateway {
    pub fn new(
        backend: Arc<dyn CommerceBackend>,
        cache: TtlCache,
        health: Arc<HealthMonitor>,
        retry: RetryPolicy,
    ) -> Self {
        Self { backend, cache, health, retry }
    }

    pub async fn execute(&self, call: &ToolCall, access_token: Option<&str>) -> ToolOutcome {
        let cache_key = call.kind.is_cacheable().then(|| cache_key(call.kind, &call.arguments));

        if let Some(key) = &cache_key {
            if let Some(cached) = self.cache.get(key) {
                self.health.record_cache(true);
                debug!(event_name = "gateway.cache_hit", tool = %call.kind, "served from cache");
                return ToolOutcome::ok(cached);
            }
            self.health.record_cache(false);
        }

        let started = tokio::time::Instant::now();
        let result = run_with_retry(&self.retry, call.kind.name(), || {
            self.backend.call(call.kind, &call.arguments, access_token)
        })
        .await;
        let latency = started.elapsed();

        match result {
            Ok(value) => {
                self.health.record_call(latency, true);
                if let Some(key) = cache_key {
                    self.cache.insert(key, value.clone());
                }
                debug!(
                    event_name = "gateway.call_succeeded",
                    tool = %call.kind,
                    latency_ms = latency.as_millis() as u64,
                    "tool call succeeded"
                );
                ToolOutcome::ok(value)
            }
            Err(error) => {
                self.health.record_call(latency, false);
                warn!(
                    event_name = "gateway.call_failed",
                    tool = %call.kind,
                    latency_ms = latency.as_millis() as u64,
                    error = %error,
                    "tool call failed"
                );
                ToolOutcome::error(encode_error(&error))
            }
        }
    }
}

/// Failures never cross the gateway boundary as `Err`; the payload keeps
/// enough structure (status, exhaustion flag) for the engine to react.
fn encode_error(error: &RetryError<BackendError>) -> Value {
    let mut payload = Map::new();
    payload.insert("error".to_owned(), Value::String(error.to_string()));

    match error {
        RetryError::Exhausted { attempts, source, .. } => {
            payload.insert("retry_exhausted".to_owned(), Value::Bool(true));
            payload.insert("attempts".to_owned(), json!(attempts));
            payload.insert("cause".to_owned(), Value::String(source.to_string()));
            if let BackendError::Status { status, .. } = source {
                payload.insert("status".to_owned(), json!(status));
            }
        }
        RetryError::Fatal(source) => {
            payload.insert("cause".to_owned(), Value::String(source.to_string()));
            if let BackendError::Status { status, .. } = source {
                payload.insert("status".to_owned(), json!(status));
            }
        }
    }

    Value::Object(payload)
}

/// Deterministic composite key: operation name plus arguments with object
/// keys sorted recursively, so semantically equal argument objects collide.
pub fn cache_key(kind: ToolKind, arguments: &Value) -> String {
    format!("{}:{}", kind.name(), canonical(arguments))
}

fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", key, canonical(&map[key])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use cartwheel_core::domain::tool::{ToolCall, ToolKind};

    use super::{cache_key, BackendError, CommerceBackend, ToolGateway};
    use crate::cache::TtlCache;
    use crate::health::HealthMonitor;
    use crate::retry::RetryPolicy;

    struct CountingBackend {
        calls: AtomicU32,
        fail_with: Option<BackendError>,
    }

    impl CountingBackend {
        fn succeeding() -> Self {
            Self { calls: AtomicU32::new(0), fail_with: None }
        }

        fn failing(error: BackendError) -> Self {
            Self { calls: AtomicU32::new(0), fail_with: Some(error) }
        }
    }

    #[async_trait]
    impl CommerceBackend for CountingBackend {
        async fn call(
            &self,
            tool: ToolKind,
            _arguments: &Value,
            _access_token: Option<&str>,
        ) -> Result<Value, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(error) => Err(error.clone()),
                None => Ok(json!({ "tool": tool.name() })),
            }
        }
    }

    fn gateway(backend: Arc<CountingBackend>) -> ToolGateway {
        ToolGateway::new(
            backend,
            TtlCache::new(Duration::from_secs(60), 16),
            Arc::new(HealthMonitor::new(Duration::from_secs(60))),
            RetryPolicy { max_retries: 1, initial_delay: Duration::from_millis(1), ..RetryPolicy::default() },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn cacheable_reads_hit_the_backend_once() {
        let backend = Arc::new(CountingBackend::succeeding());
        let gateway = gateway(backend.clone());
        let call = ToolCall::new("c1", ToolKind::SearchProducts, json!({ "query": "camera" }));

        let first = gateway.execute(&call, None).await;
        let second = gateway.execute(&call, None).await;

        assert!(!first.is_error);
        assert_eq!(first, second);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_bypass_the_cache() {
        let backend = Arc::new(CountingBackend::succeeding());
        let gateway = gateway(backend.clone());
        let call = ToolCall::new("c1", ToolKind::AddCartEntry, json!({ "product_code": "p1" }));

        gateway.execute(&call, None).await;
        gateway.execute(&call, None).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn business_errors_are_encoded_not_retried() {
        let backend = Arc::new(CountingBackend::failing(BackendError::Status {
            status: 404,
            message: "cart not found".to_owned(),
        }));
        let gateway = gateway(backend.clone());
        let call = ToolCall::new("c1", ToolKind::GetCart, json!({ "cart_id": "nope" }));

        let outcome = gateway.execute(&call, None).await;

        assert!(outcome.is_error);
        assert_eq!(outcome.content["status"], json!(404));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_then_report_exhaustion() {
        let backend = Arc::new(CountingBackend::failing(BackendError::Status {
            status: 503,
            message: "backend down".to_owned(),
        }));
        let gateway = gateway(backend.clone());
        let call = ToolCall::new("c1", ToolKind::GetCart, json!({ "cart_id": "c" }));

        let outcome = gateway.execute(&call, None).await;

        assert!(outcome.is_error);
        assert_eq!(outcome.content["retry_exhausted"], json!(true));
        assert_eq!(outcome.content["status"], json!(503));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2, "initial call plus one retry");
    }

    #[test]
    fn cache_key_is_insensitive_to_argument_key_order() {
        let a = cache_key(ToolKind::SearchProducts, &json!({ "query": "cam", "page_size": 5 }));
        let b = cache_key(ToolKind::SearchProducts, &json!({ "page_size": 5, "query": "cam" }));
        assert_eq!(a, b);

        let c = cache_key(ToolKind::SearchProducts, &json!({ "query": "other", "page_size": 5 }));
        assert_ne!(a, c);
    }
}
