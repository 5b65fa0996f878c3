//! Request log sink (spec §6 `LogSink`): `insertPending` is called
//! synchronously before a task is admitted; `updateCompleted` fires once,
//! exactly once, regardless of how the task finished. Neither is allowed
//! to block the request path, so both are fire-and-forget from the
//! orchestrator's point of view.

use chrono::{DateTime, Utc};
use std::fmt;

/// One row of the request log. Mirrors spec §6's `LogRow` shape; the
/// concrete sink decides how (or whether) to persist it.
#[derive(Debug, Clone)]
pub struct LogRow {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub provider_id: String,
    pub queued_at: DateTime<Utc>,
    pub status: Option<u16>,
    pub error_code: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LogRow {
    pub fn pending(request_id: String, method: String, path: String, provider_id: String) -> Self {
        Self {
            request_id,
            method,
            path,
            provider_id,
            queued_at: Utc::now(),
            status: None,
            error_code: None,
            completed_at: None,
        }
    }
}

/// A destination for request log rows. `insert_pending`/`update_completed`
/// are spawned by the caller rather than awaited inline, so an
/// implementation that's slow (a real database) never adds latency to the
/// request path itself.
pub trait LogSink: Send + Sync {
    fn insert_pending(&self, row: LogRow);
    fn update_completed(&self, request_id: &str, status: Option<u16>, error_code: Option<String>);
}

/// Default sink: writes one structured log line per event. Sufficient for
/// this crate's observability needs without taking on a database
/// dependency.
pub struct ConsoleLogSink;

impl LogSink for ConsoleLogSink {
    fn insert_pending(&self, row: LogRow) {
        log::info!(
            "request pending: id={} method={} path={} provider={}",
            row.request_id,
            row.method,
            row.path,
            row.provider_id
        );
    }

    fn update_completed(&self, request_id: &str, status: Option<u16>, error_code: Option<String>) {
        match (status, error_code) {
            (Some(status), _) => {
                log::info!("request completed: id={request_id} status={status}");
            }
            (None, Some(code)) => {
                log::warn!("request completed: id={request_id} error={code}");
            }
            (None, None) => {
                log::warn!("request completed: id={request_id} with no status or error code");
            }
        }
    }
}

impl fmt::Debug for ConsoleLogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConsoleLogSink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        pending: Mutex<Vec<String>>,
        completed: Mutex<Vec<(String, Option<u16>, Option<String>)>>,
    }

    impl LogSink for RecordingSink {
        fn insert_pending(&self, row: LogRow) {
            self.pending.lock().unwrap().push(row.request_id);
        }

        fn update_completed(&self, request_id: &str, status: Option<u16>, error_code: Option<String>) {
            self.completed
                .lock()
                .unwrap()
                .push((request_id.to_string(), status, error_code));
        }
    }

    #[test]
    fn sink_is_usable_as_trait_object() {
        let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());
        let row = LogRow::pending(
            "req-1".to_string(),
            "POST".to_string(),
            "/v1/messages".to_string(),
            "anthropic".to_string(),
        );
        sink.insert_pending(row);
        sink.update_completed("req-1", Some(200), None);
    }
}
