//! Response writer multiplexer: converts a tagged proxy result into the
//! actix-web response, regardless of which of the three kinds produced it
//! (spec §4.7, §9 "dynamic dispatch across writer kinds").

use crate::error::ProxyError;
use crate::executor::ExecutorOutcome;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, HttpResponseBuilder};

/// Builds the final `HttpResponse` for a successful upstream call. For a
/// streamed (SSE) result this is a no-op beyond constructing the
/// `HttpResponse::streaming` wrapper — by the time this is called the
/// status line has conceptually already been decided; actix buffers the
/// write until the handler returns the body, so there's nothing extra to
/// flush here, unlike runtimes that hand out a raw writable socket.
pub fn write_success(outcome: ExecutorOutcome) -> HttpResponse {
    match outcome {
        ExecutorOutcome::Buffered {
            status,
            headers,
            body,
        } => {
            let mut builder = status_builder(status);
            apply_headers(&mut builder, &headers);
            builder.body(body)
        }
        ExecutorOutcome::Streamed {
            status,
            headers,
            stream,
        } => {
            let mut builder = status_builder(status);
            apply_headers(&mut builder, &headers);
            builder.streaming(stream)
        }
    }
}

/// Builds the response for a classifier-level block rule (spec §4.7
/// `ClassifyBlocked`): status and body both come from the rule, default
/// 200 when unspecified.
pub fn write_blocked(status: u16, body: serde_json::Value) -> HttpResponse {
    status_builder(status).json(body)
}

/// Builds the response for any of the `ProxyError` variants that still
/// produce a client-visible response (everything except
/// `ClientDisconnected`, which the caller should simply drop).
pub fn write_error(error: &ProxyError) -> HttpResponse {
    actix_web::ResponseError::error_response(error)
}

fn status_builder(status: u16) -> HttpResponseBuilder {
    HttpResponse::build(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
}

/// Copies upstream headers onto the outbound response, skipping
/// hop-by-hop headers that don't survive a proxy hop.
fn apply_headers(builder: &mut HttpResponseBuilder, headers: &[(String, String)]) {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "transfer-encoding",
        "upgrade",
        "proxy-connection",
        "content-length",
    ];
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        builder.insert_header((name.as_str(), value.as_str()));
    }
}
