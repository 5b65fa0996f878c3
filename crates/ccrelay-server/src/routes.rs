//! HTTP surface for the `ccrelay-server` binary: the catch-all proxy
//! route, the `/ccrelay/ws` coordination-channel upgrade, and the `501`
//! stub for `/ccrelay/api/*` (SPEC_FULL.md §2 item 10).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse};
use ccrelay_core::coordination::Leader;
use ccrelay_core::error::ProxyError;
use ccrelay_core::executor::ExecutorOutcome;
use ccrelay_core::orchestrator::{InboundRequest, Orchestrator, OrchestratorOutcome};
use ccrelay_core::writer::{write_blocked, write_error, write_success};
use futures_util::Stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a request handler needs, shared across the process.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub leader: Arc<Leader>,
    pub config: ccrelay_core::config::ConfigHandle,
}

/// Cancels the request's abort token when dropped — either because the
/// handler future itself was dropped (actix-web does this when the
/// underlying connection closes while the handler is still awaiting) or
/// because the streamed response body it was moved into (see
/// `GuardedStream` below) finished or was abandoned. Either way, a client
/// disconnect reaches the scheduler and executor within one await point
/// (spec §4.5, §4.6 step 9).
struct AbortOnDrop(CancellationToken);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Keeps a streamed response body's `AbortOnDrop` guard alive for the
/// stream's own lifetime instead of the handler function's.
///
/// `proxy_handler` returns as soon as the upstream response headers are
/// read; for a streamed (SSE) outcome, actix-web then polls this body
/// *after* the handler future has already completed. A guard owned by a
/// handler-local would therefore fire — and cancel the request — the
/// instant the handler returned, before a single byte of the body had been
/// forwarded. Moving the guard into the body stream itself ties its drop
/// to the body's actual end of life: natural completion, or actix dropping
/// the stream early because the client went away.
struct GuardedStream<S> {
    inner: S,
    _guard: AbortOnDrop,
}

impl<S: Stream<Item = Result<Bytes, ProxyError>> + Unpin> Stream for GuardedStream<S> {
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Everything not matched by the two routes below is ordinary client
/// traffic, subject to classification (spec §6 "Inbound HTTP").
async fn proxy_handler(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    let abort = CancellationToken::new();
    let guard = AbortOnDrop(abort.clone());

    let client_id = req
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let inbound = InboundRequest {
        method: req.method().to_string(),
        path: req.path().to_string(),
        headers,
        body,
        client_id,
    };

    match state.orchestrator.handle(inbound, abort).await {
        Ok(OrchestratorOutcome::Blocked { status, body }) => write_blocked(status, body),
        Ok(OrchestratorOutcome::Upstream(ExecutorOutcome::Streamed { status, headers, stream })) => {
            let guarded = GuardedStream {
                inner: stream,
                _guard: guard,
            };
            write_success(ExecutorOutcome::Streamed {
                status,
                headers,
                stream: Box::pin(guarded),
            })
        }
        Ok(OrchestratorOutcome::Upstream(outcome)) => write_success(outcome),
        Err(e @ ProxyError::ClientDisconnected) => {
            log::debug!("client disconnected before a response could be written: {e}");
            HttpResponse::Ok().finish()
        }
        Err(e) => write_error(&e),
    }
}

/// Upgrades to the Leader/Follower coordination channel (spec §4.8,
/// §6 "Control-channel endpoint").
async fn control_ws_handler(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;
    let leader = state.leader.clone();
    let providers = Arc::new(state.config.snapshot().await.providers.clone());
    actix_web::rt::spawn(async move {
        leader.handle_connection(session, msg_stream, providers).await;
    });
    Ok(response)
}

/// The control API (status/providers/logs/stats) is an out-of-scope
/// collaborator (spec §1). This stub lets a client distinguish "the
/// proxy's own surface, not yet wired to a control plane" from "classified
/// as ordinary traffic" (SPEC_FULL.md §2).
async fn control_api_stub() -> HttpResponse {
    HttpResponse::NotImplemented().json(serde_json::json!({
        "error": "the control API is not implemented by this engine",
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ccrelay/ws", web::get().to(control_ws_handler))
        .route("/ccrelay/api/{tail:.*}", web::route().to(control_api_stub))
        .default_service(web::route().to(proxy_handler));
}
