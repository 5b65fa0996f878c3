//! Request orchestrator: wires classifier → transformer → concurrency
//! manager → executor → writer into a single call per inbound request
//! (spec §2, §4.9).

use crate::classify::{Classification, Classifier, CurrentProvider, RequestView};
use crate::concurrency::ConcurrencyManager;
use crate::config::{ConcurrencyConfig, Config, ConfigHandle};
use crate::error::ProxyError;
use crate::executor::{ExecutorOutcome, UpstreamExecutor};
use crate::logs::{LogRow, LogSink};
use crate::matcher::MatcherError;
use crate::task::RequestSnapshot;
use crate::transform::{transform_request, CompiledModelMap};
use actix_web::web::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Everything needed to describe an inbound request, independent of the
/// web framework handler that received it.
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Identifies the connection/client for logging and priority
    /// decisions; callers typically derive this from the peer address or
    /// an API key prefix.
    pub client_id: String,
}

/// What the orchestrator resolved a request to, before the writer turns
/// it into an HTTP response.
pub enum OrchestratorOutcome {
    Blocked { status: u16, body: Value },
    Upstream(ExecutorOutcome),
}

struct CachedClassifier {
    version: u64,
    classifier: Arc<Classifier>,
}

/// Ties the engine's components together behind one call. Cheap to
/// clone; holds only `Arc`/handle types.
#[derive(Clone)]
pub struct Orchestrator {
    config: ConfigHandle,
    classifier_cache: Arc<RwLock<Option<CachedClassifier>>>,
    concurrency: ConcurrencyManager,
    executor: Arc<UpstreamExecutor>,
    current_provider: CurrentProvider,
    log_sink: Arc<dyn LogSink>,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl Orchestrator {
    pub fn new(
        config: ConfigHandle,
        concurrency: ConcurrencyManager,
        executor: UpstreamExecutor,
        current_provider: CurrentProvider,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            config,
            classifier_cache: Arc::new(RwLock::new(None)),
            concurrency,
            executor: Arc::new(executor),
            current_provider,
            log_sink,
        }
    }

    /// Run one request end to end. Captures a single `Config` snapshot up
    /// front (spec §4.9) so a concurrent reload never produces an
    /// inconsistent view mid-request.
    pub async fn handle(
        &self,
        req: InboundRequest,
        abort: CancellationToken,
    ) -> Result<OrchestratorOutcome, ProxyError> {
        let snapshot = self.config.snapshot().await;
        let classifier = self.classifier_for(&snapshot).await?;

        let view = RequestView {
            method: &req.method,
            path: &req.path,
        };
        let current = self.current_provider.get();
        let classification = classifier.classify(&view, &current);

        let request_id = format!("req-{}", next_request_id());
        self.log_sink.insert_pending(LogRow::pending(
            request_id.clone(),
            req.method.clone(),
            req.path.clone(),
            classification_provider_id(&classification),
        ));

        let result = self.run_classified(&snapshot, req, classification, abort).await;

        match &result {
            Ok(OrchestratorOutcome::Blocked { status, .. }) => {
                self.log_sink.update_completed(&request_id, Some(*status), None);
            }
            Ok(OrchestratorOutcome::Upstream(ExecutorOutcome::Buffered { status, .. })) => {
                self.log_sink.update_completed(&request_id, Some(*status), None);
            }
            Ok(OrchestratorOutcome::Upstream(ExecutorOutcome::Streamed { status, .. })) => {
                self.log_sink.update_completed(&request_id, Some(*status), None);
            }
            Err(e) => {
                self.log_sink
                    .update_completed(&request_id, None, Some(error_code(e)));
            }
        }

        result
    }

    async fn run_classified(
        &self,
        snapshot: &Arc<Config>,
        req: InboundRequest,
        classification: Classification,
        abort: CancellationToken,
    ) -> Result<OrchestratorOutcome, ProxyError> {
        match classification {
            Classification::Block { status, body } => Ok(OrchestratorOutcome::Blocked { status, body }),
            Classification::Passthrough {
                provider_id,
                route_queue_key,
            } => {
                let provider = snapshot.providers.get(&provider_id).ok_or_else(|| {
                    ProxyError::Internal(format!("passthrough references unknown provider {provider_id:?}"))
                })?;
                // Passthrough forwards bytes verbatim: no transform, no
                // header injection, but still goes through the scheduler
                // (spec §4.1 resolves the open question this way).
                let headers = req.headers.clone();
                let body = req.body.to_vec();
                let priority = priority_for_queue(snapshot, &route_queue_key);
                self.dispatch(
                    snapshot,
                    &route_queue_key,
                    priority,
                    Arc::new(provider.clone()),
                    req,
                    headers,
                    body,
                    abort,
                )
                .await
            }
            Classification::Route {
                provider_id,
                route_queue_key,
            } => {
                let provider = snapshot.providers.get(&provider_id).ok_or_else(|| {
                    ProxyError::Internal(format!("route references unknown provider {provider_id:?}"))
                })?;
                let priority = priority_for_queue(snapshot, &route_queue_key);

                let vl_map = CompiledModelMap::compile(&provider.vl_model_map).map_err(classifier_error)?;
                let model_map = CompiledModelMap::compile(&provider.model_map).map_err(classifier_error)?;
                let mut headers = req.headers.clone();
                let body = transform_request(provider, &vl_map, &model_map, &req.body, &mut headers);

                self.dispatch(
                    snapshot,
                    &route_queue_key,
                    priority,
                    Arc::new(provider.clone()),
                    req,
                    headers,
                    body,
                    abort,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        snapshot: &Arc<Config>,
        queue_key: &str,
        priority: i64,
        provider: Arc<crate::config::Provider>,
        req: InboundRequest,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        abort: CancellationToken,
    ) -> Result<OrchestratorOutcome, ProxyError> {
        let cfg = concurrency_config_for_queue(snapshot, queue_key);
        let request_snapshot = RequestSnapshot {
            method: req.method,
            path: req.path,
            headers,
            body: Bytes::from(body),
            provider,
        };

        let running = self
            .concurrency
            .submit(queue_key, cfg, priority, req.client_id, abort.clone(), request_snapshot.clone())
            .await?;

        let connect_timeout_sec = cfg.queue_wait_timeout_sec;
        let outcome = self
            .executor
            .execute(&request_snapshot, &abort, connect_timeout_sec)
            .await;

        // A streamed (SSE) outcome has only read headers by this point —
        // the body is still being piped. The slot can't be released until
        // that body is fully drained, so the `RunningTask` rides along
        // inside the stream instead of completing here (spec §4.5).
        match outcome {
            Ok(ExecutorOutcome::Streamed { status, headers, stream }) => {
                let held = crate::concurrency::HoldSlotWhileStreaming::new(stream, running);
                Ok(OrchestratorOutcome::Upstream(ExecutorOutcome::Streamed {
                    status,
                    headers,
                    stream: Box::pin(held),
                }))
            }
            Ok(other) => {
                running.complete().await;
                Ok(OrchestratorOutcome::Upstream(other))
            }
            Err(e) => {
                running.complete().await;
                Err(e)
            }
        }
    }

    async fn classifier_for(&self, snapshot: &Arc<Config>) -> Result<Arc<Classifier>, ProxyError> {
        let version = self.config.version();
        {
            let cache = self.classifier_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.version == version {
                    return Ok(cached.classifier.clone());
                }
            }
        }
        let classifier = Arc::new(Classifier::from_config(snapshot).map_err(classifier_error)?);
        let mut cache = self.classifier_cache.write().await;
        *cache = Some(CachedClassifier {
            version,
            classifier: classifier.clone(),
        });
        Ok(classifier)
    }
}

fn classification_provider_id(classification: &Classification) -> String {
    match classification {
        Classification::Block { .. } => "blocked".to_string(),
        Classification::Passthrough { provider_id, .. } => provider_id.clone(),
        Classification::Route { provider_id, .. } => provider_id.clone(),
    }
}

fn classifier_error(e: MatcherError) -> ProxyError {
    ProxyError::Internal(format!("invalid route pattern: {e}"))
}

fn priority_for_queue(config: &Config, key: &str) -> i64 {
    config
        .route_queues
        .iter()
        .find(|rq| rq.key == key)
        .map(|rq| rq.priority)
        .unwrap_or(0)
}

fn concurrency_config_for_queue(config: &Config, key: &str) -> ConcurrencyConfig {
    config
        .route_queues
        .iter()
        .find(|rq| rq.key == key)
        .map(|rq| rq.concurrency)
        .unwrap_or_else(|| config.default_concurrency())
}

fn error_code(e: &ProxyError) -> String {
    match e {
        ProxyError::ClassifyBlocked { .. } => "CLASSIFY_BLOCKED".to_string(),
        ProxyError::QueueFull => "QUEUE_FULL_OR_TIMEOUT".to_string(),
        ProxyError::QueueTimeout => "QUEUE_FULL_OR_TIMEOUT".to_string(),
        ProxyError::QueueCleared => "QUEUE_CLEARED".to_string(),
        ProxyError::UpstreamConnectionError(_) => "UPSTREAM_CONNECTION_ERROR".to_string(),
        ProxyError::UpstreamHTTPError { .. } => "UPSTREAM_HTTP_ERROR".to_string(),
        ProxyError::UpstreamProtocolError(_) => "UPSTREAM_PROTOCOL_ERROR".to_string(),
        ProxyError::ClientDisconnected => "CLIENT_DISCONNECTED".to_string(),
        ProxyError::ServerShuttingDown => "SERVER_SHUTTING_DOWN".to_string(),
        ProxyError::Internal(_) => "INTERNAL".to_string(),
    }
}

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderMode, ProviderType, Routing};
    use crate::logs::ConsoleLogSink;
    use std::collections::HashMap;

    fn base_config() -> Config {
        let mut providers = HashMap::new();
        providers.insert(
            "anthropic".to_string(),
            crate::config::Provider {
                id: "anthropic".to_string(),
                name: "Anthropic".to_string(),
                base_url: "http://127.0.0.1:0".to_string(),
                mode: ProviderMode::Passthrough,
                provider_type: ProviderType::Anthropic,
                api_key: None,
                auth_header: None,
                model_map: vec![],
                vl_model_map: vec![],
                extra_headers: HashMap::new(),
                enabled: true,
            },
        );
        Config {
            host: "0.0.0.0".to_string(),
            port: 8080,
            providers,
            default_provider: "anthropic".to_string(),
            routing: Routing::default(),
            concurrency: None,
            route_queues: vec![],
            proxy_timeout_sec: 60,
        }
    }

    #[test]
    fn priority_falls_back_to_zero_when_queue_key_unconfigured() {
        let config = base_config();
        assert_eq!(priority_for_queue(&config, "default"), 0);
    }

    #[test]
    fn concurrency_falls_back_to_config_default() {
        let config = base_config();
        let cfg = concurrency_config_for_queue(&config, "default");
        assert_eq!(cfg.max_workers, ConcurrencyConfig::default().max_workers);
    }

    #[tokio::test]
    async fn block_rule_short_circuits_before_dispatch() {
        let mut config = base_config();
        config.routing.block.push(crate::config::RouteRule {
            path: "/ccrelay/health".to_string(),
            kind: None,
            provider_id: None,
            response_code: Some(200),
            response_body: Some(serde_json::json!({"status": "ok"})),
            route_queue_key: None,
        });
        let handle = ConfigHandle::new(config, "unused.json");
        let orchestrator = Orchestrator::new(
            handle,
            ConcurrencyManager::new(),
            UpstreamExecutor::new(),
            CurrentProvider::new("anthropic".to_string()),
            Arc::new(ConsoleLogSink),
        );
        let req = InboundRequest {
            method: "GET".to_string(),
            path: "/ccrelay/health".to_string(),
            headers: vec![],
            body: Bytes::new(),
            client_id: "test".to_string(),
        };
        let outcome = orchestrator.handle(req, CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, OrchestratorOutcome::Blocked { status: 200, .. }));
    }
}
