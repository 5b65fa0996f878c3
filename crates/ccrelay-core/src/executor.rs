//! Upstream executor: opens the outbound HTTP connection, streams the
//! request body, detects SSE vs buffered responses, forwards bytes, and
//! handles the single 429 retry (spec §4.6).

use crate::error::ProxyError;
use crate::task::RequestSnapshot;
use actix_web::web::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Method;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Upstream responses that pass through headers+status as retrieved, but
/// differ in how the body is delivered downstream.
pub enum ExecutorOutcome {
    /// Collected up to the configured cap, ready to hand to the writer in
    /// one shot.
    Buffered {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    /// `Content-Type: text/event-stream` was detected; headers must be
    /// written to the client immediately and chunks piped through as they
    /// arrive.
    Streamed {
        status: u16,
        headers: Vec<(String, String)>,
        stream: Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>,
    },
}

/// Cap on a buffered response body; matches the payload cap the rest of
/// the workspace's proxy routes use for request bodies.
const BUFFERED_BODY_CAP: usize = 16 * 1024 * 1024;

/// Upstream will not be asked to wait longer than this for a `Retry-After`
/// on a 429 before the retry is abandoned and the 429 passed through as-is.
const RETRY_AFTER_CAP_SECS: u64 = 30;

/// `reqwest::Client::builder().connect_timeout(..)` is a client-wide
/// setting, but spec §4.6 step 2 wants a connect timeout of
/// `min(5s, queueWaitTimeoutSec)` per *route*, and routes can configure
/// different `queueWaitTimeoutSec` values. Rather than rebuild a client (and
/// lose its connection pool) on every call, a small client is cached per
/// distinct connect-timeout value — in practice one or two entries, one per
/// route shape that actually differs.
pub struct UpstreamExecutor {
    clients: RwLock<HashMap<u64, reqwest::Client>>,
}

/// Hard ceiling for the connect timeout regardless of `queueWaitTimeoutSec`
/// (spec §4.6 step 2: "min(5s, queueWaitTimeoutSec)").
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

impl UpstreamExecutor {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the client built for this route's connect timeout,
    /// building and caching one on first use.
    async fn client_for(&self, connect_timeout: Duration) -> reqwest::Client {
        let key = connect_timeout.as_micros() as u64;
        if let Some(existing) = self.clients.read().await.get(&key) {
            return existing.clone();
        }
        self.clients
            .write()
            .await
            .entry(key)
            .or_insert_with(|| {
                reqwest::Client::builder()
                    .connect_timeout(connect_timeout)
                    .pool_idle_timeout(Duration::from_secs(30))
                    .pool_max_idle_per_host(32)
                    .build()
                    .expect("failed to build upstream HTTP client")
            })
            .clone()
    }

    /// Issue the upstream call for a dispatched Task. `abort` is the
    /// per-task cancellation signal shared with the concurrency manager;
    /// if it fires while we're waiting on upstream I/O, the in-flight
    /// connection is torn down within one await point. `queue_wait_timeout_sec`
    /// is the dispatching route's `ConcurrencyConfig.queueWaitTimeoutSec`,
    /// used to bound the connect phase per spec §4.6 step 2.
    pub async fn execute(
        &self,
        request: &RequestSnapshot,
        abort: &CancellationToken,
        queue_wait_timeout_sec: f64,
    ) -> Result<ExecutorOutcome, ProxyError> {
        let url = format!("{}{}", request.provider.base_url, request.path);
        let connect_timeout =
            Duration::from_secs_f64(queue_wait_timeout_sec.max(0.001)).min(MAX_CONNECT_TIMEOUT);
        let client = self.client_for(connect_timeout).await;
        let mut retried = false;

        loop {
            let response = self.send_once(&client, &url, request, abort).await?;

            if response.status().as_u16() == 429 && !retried {
                if let Some(delay) = retry_after_within_cap(response.headers()) {
                    retried = true;
                    log::info!("upstream 429 for {url}, retrying after {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = abort.cancelled() => return Err(ProxyError::ClientDisconnected),
                    }
                }
            }

            return self.into_outcome(response, abort.clone()).await;
        }
    }

    async fn send_once(
        &self,
        client: &reqwest::Client,
        url: &str,
        request: &RequestSnapshot,
        abort: &CancellationToken,
    ) -> Result<reqwest::Response, ProxyError> {
        let method =
            Method::from_bytes(request.method.as_bytes()).unwrap_or(Method::GET);
        let mut builder = client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = builder.body(request.body.to_vec());

        tokio::select! {
            result = builder.send() => {
                result.map_err(|e| classify_send_error(&e))
            }
            _ = abort.cancelled() => Err(ProxyError::ClientDisconnected),
        }
    }

    async fn into_outcome(
        &self,
        response: reqwest::Response,
        abort: CancellationToken,
    ) -> Result<ExecutorOutcome, ProxyError> {
        let status = response.status().as_u16();
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        if is_sse {
            log::debug!("upstream response is SSE, forwarding streamed");
            let upstream = response.bytes_stream();
            let stream = upstream.map(move |chunk| {
                chunk.map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))
            });
            let stream = CancelOnAbort::new(stream, abort);
            return Ok(ExecutorOutcome::Streamed {
                status,
                headers,
                stream: Box::pin(stream),
            });
        }

        let mut collected = Vec::new();
        let mut body_stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                chunk = body_stream.next() => chunk,
                _ = abort.cancelled() => return Err(ProxyError::ClientDisconnected),
            };
            match next {
                None => break,
                Some(Ok(chunk)) => {
                    if collected.len() + chunk.len() > BUFFERED_BODY_CAP {
                        return Err(ProxyError::UpstreamProtocolError(
                            "response body exceeded buffered cap".to_string(),
                        ));
                    }
                    collected.extend_from_slice(&chunk);
                }
                Some(Err(e)) => {
                    return Err(ProxyError::UpstreamProtocolError(e.to_string()));
                }
            }
        }

        Ok(ExecutorOutcome::Buffered {
            status,
            headers,
            body: Bytes::from(collected),
        })
    }
}

impl Default for UpstreamExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a byte stream so that if the task's abort signal fires mid-stream
/// the stream ends immediately, tearing the client-facing response down
/// rather than continuing to forward a disconnected client's bytes
/// (spec §4.6 step 9).
struct CancelOnAbort<S> {
    inner: S,
    abort: CancellationToken,
}

impl<S> CancelOnAbort<S> {
    fn new(inner: S, abort: CancellationToken) -> Self {
        Self { inner, abort }
    }
}

impl<S: Stream<Item = Result<Bytes, ProxyError>> + Unpin> Stream for CancelOnAbort<S> {
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if self.abort.is_cancelled() {
            return std::task::Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

fn retry_after_within_cap(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = raw.parse().ok()?;
    if seconds <= RETRY_AFTER_CAP_SECS {
        Some(Duration::from_secs(seconds))
    } else {
        None
    }
}

fn classify_send_error(err: &reqwest::Error) -> ProxyError {
    if err.is_connect() || err.is_timeout() {
        ProxyError::UpstreamConnectionError(err.to_string())
    } else {
        ProxyError::UpstreamProtocolError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_respects_cap() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "1".parse().unwrap());
        assert_eq!(retry_after_within_cap(&headers), Some(Duration::from_secs(1)));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(retry_after_within_cap(&headers), None);
    }
}
