//! Hand-rolled HTTP/1.1 mock upstream for the scenario tests in
//! `scenarios.rs` (SPEC_FULL.md §8: "a tiny `tokio::net::TcpListener`-based
//! HTTP responder configurable with canned delays/status codes/SSE
//! bodies"). Deliberately minimal — just enough request-line/header
//! parsing to drain the inbound body before replying, nothing that a real
//! mock-HTTP crate would be needed for.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One scripted reply. Consumed in order as connections arrive; the last
/// entry repeats once the script is exhausted.
#[derive(Clone)]
pub enum Scripted {
    /// Wait `delay`, then reply with `status` and `body`.
    Delayed {
        delay: Duration,
        status: u16,
        body: &'static str,
    },
    /// Reply immediately with extra headers (used for `Retry-After`).
    WithHeaders {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: &'static str,
    },
    /// Reply as `text/event-stream`, emitting each event with `gap`
    /// between them, then close the connection.
    Sse {
        events: Vec<&'static str>,
        gap: Duration,
    },
}

pub struct MockUpstream {
    addr: std::net::SocketAddr,
    call_count: Arc<AtomicUsize>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(script: Vec<Scripted>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let call_count = Arc::new(AtomicUsize::new(0));
        let counter = call_count.clone();

        let handle = tokio::spawn(async move {
            let script = Arc::new(script);
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let script = script.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let index = counter.fetch_add(1, Ordering::SeqCst);
                    let entry = script
                        .get(index)
                        .or_else(|| script.last())
                        .cloned()
                        .unwrap_or(Scripted::WithHeaders {
                            status: 200,
                            headers: vec![],
                            body: "",
                        });
                    let _ = serve_one(&mut socket, entry).await;
                });
            }
        });

        Self {
            addr,
            call_count,
            _handle: handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

async fn serve_one(socket: &mut tokio::net::TcpStream, entry: Scripted) -> std::io::Result<()> {
    read_request(socket).await?;

    match entry {
        Scripted::Delayed { delay, status, body } => {
            tokio::time::sleep(delay).await;
            write_response(socket, status, &[], body).await?;
        }
        Scripted::WithHeaders { status, headers, body } => {
            let header_refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
            write_response(socket, status, &header_refs, body).await?;
        }
        Scripted::Sse { events, gap } => {
            let header = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
            socket.write_all(header.as_bytes()).await?;
            socket.flush().await?;
            for event in events {
                let frame = format!("data: {event}\n\n");
                socket.write_all(frame.as_bytes()).await?;
                socket.flush().await?;
                tokio::time::sleep(gap).await;
            }
        }
    }
    Ok(())
}

/// Reads the request line + headers, then drains exactly `Content-Length`
/// more bytes if present. Doesn't need to understand the request beyond
/// that — every scenario's mock reply is driven by the script, not by the
/// inbound path/body.
async fn read_request(socket: &mut tokio::net::TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]);
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let already_read = buf.len() - header_end;
    if already_read < content_length {
        let mut remaining = vec![0u8; content_length - already_read];
        socket.read_exact(&mut remaining).await?;
    }
    Ok(())
}

async fn write_response(
    socket: &mut tokio::net::TcpStream,
    status: u16,
    headers: &[(&str, &str)],
    body: &str,
) -> std::io::Result<()> {
    let reason = reason_phrase(status);
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(body);
    socket.write_all(response.as_bytes()).await?;
    socket.flush().await
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        429 => "Too Many Requests",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
