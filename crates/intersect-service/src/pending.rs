// SPDX-License-Identifier: MIT OR Apache-2.0
//! Correlation bookkeeping for service-to-service requests.
//!
//! Every outbound tracked request gets a `PendingRequest` entry; the entry
//! is removed *before* its handler runs, so a response, a timeout, and a
//! shutdown can race without the handler ever firing twice.

use intersect_core::{ErrorRecord, WireErrorCode};
use intersect_schema::{ResponseHandler, ServiceResponse};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCAN_PERIOD: Duration = Duration::from_millis(100);

/// Default deadline for tracked requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

struct PendingRequest {
    destination: String,
    operation_id: String,
    response_handler: Option<ResponseHandler>,
    deadline: Instant,
    campaign_id: Option<Uuid>,
}

#[derive(Default)]
struct Table {
    entries: BTreeMap<Uuid, PendingRequest>,
}

/// Tracks outstanding requests and fires each handler exactly once.
#[derive(Clone)]
pub struct RequestBookkeeper {
    table: Arc<Mutex<Table>>,
    scan: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Default for RequestBookkeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBookkeeper {
    /// An empty bookkeeper. Call [`start_scan`](Self::start_scan) once a
    /// runtime is available.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            scan: Arc::new(Mutex::new(None)),
        }
    }

    /// Record an outbound request under `request_id`.
    pub fn track(
        &self,
        request_id: Uuid,
        destination: impl Into<String>,
        operation_id: impl Into<String>,
        response_handler: Option<ResponseHandler>,
        timeout: Duration,
        campaign_id: Option<Uuid>,
    ) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.entries.insert(
            request_id,
            PendingRequest {
                destination: destination.into(),
                operation_id: operation_id.into(),
                response_handler,
                deadline: Instant::now() + timeout,
                campaign_id,
            },
        );
    }

    /// Number of outstanding entries.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.entries.len()
    }

    /// `true` when `request_id` is being tracked.
    #[must_use]
    pub fn is_tracked(&self, request_id: &Uuid) -> bool {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.entries.contains_key(request_id)
    }

    /// The campaign id recorded for a tracked request.
    #[must_use]
    pub fn campaign_of(&self, request_id: &Uuid) -> Option<Uuid> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.entries.get(request_id).and_then(|e| e.campaign_id)
    }

    /// Deliver a response to the tracked request, consuming the entry.
    ///
    /// Returns `false` when the id is unknown (already resolved, timed
    /// out, or never tracked) — the caller should fall through to normal
    /// dispatch or drop the message.
    pub fn resolve(&self, request_id: &Uuid, response: ServiceResponse) -> bool {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entries.remove(request_id)
        };
        let Some(entry) = entry else {
            return false;
        };
        debug!(%request_id, operation = %entry.operation_id, "tracked request resolved");
        if let Some(handler) = entry.response_handler {
            handler(response);
        }
        true
    }

    /// Start the single background deadline scan.
    pub fn start_scan(&self) {
        let mut scan = self.scan.lock().unwrap_or_else(|e| e.into_inner());
        if scan.is_some() {
            return;
        }
        let table = Arc::clone(&self.table);
        *scan = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCAN_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let expired: Vec<(Uuid, PendingRequest)> = {
                    let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
                    let ids: Vec<Uuid> = table
                        .entries
                        .iter()
                        .filter(|(_, e)| e.deadline <= now)
                        .map(|(id, _)| *id)
                        .collect();
                    ids.into_iter()
                        .filter_map(|id| table.entries.remove(&id).map(|e| (id, e)))
                        .collect()
                };
                for (request_id, entry) in expired {
                    info!(
                        %request_id,
                        destination = %entry.destination,
                        operation = %entry.operation_id,
                        "tracked request timed out"
                    );
                    fire_error(entry, WireErrorCode::Timeout, "no response before the deadline");
                }
            }
        }));
    }

    /// Stop the deadline scan. Outstanding entries stay tracked.
    pub fn stop_scan(&self) {
        let mut scan = self.scan.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = scan.take() {
            handle.abort();
        }
    }

    /// Fail every outstanding entry with `SHUTDOWN`.
    pub fn fail_all_for_shutdown(&self) {
        let entries: Vec<(Uuid, PendingRequest)> = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut table.entries).into_iter().collect()
        };
        for (request_id, entry) in entries {
            warn!(%request_id, operation = %entry.operation_id, "failing tracked request: shutdown");
            fire_error(entry, WireErrorCode::Shutdown, "service shut down with the request outstanding");
        }
    }
}

fn fire_error(entry: PendingRequest, code: WireErrorCode, message: &str) {
    let Some(handler) = entry.response_handler else {
        return;
    };
    let record = ErrorRecord::new(code, message);
    let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
    handler(ServiceResponse {
        source: entry.destination,
        operation: entry.operation_id,
        has_error: true,
        payload,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn collector() -> (ResponseHandler, mpsc::UnboundedReceiver<ServiceResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(move |response| drop(tx.send(response))), rx)
    }

    #[tokio::test]
    async fn response_resolves_exactly_once() {
        let bookkeeper = RequestBookkeeper::new();
        let request_id = Uuid::new_v4();
        let (handler, mut rx) = collector();
        bookkeeper.track(
            request_id,
            "o.f.s.svc",
            "Cap.op",
            Some(handler),
            Duration::from_secs(60),
            None,
        );
        assert_eq!(bookkeeper.outstanding(), 1);

        let response = ServiceResponse {
            source: "o.f.s.svc".into(),
            operation: "Cap.op".into(),
            has_error: false,
            payload: serde_json::json!("pong"),
        };
        assert!(bookkeeper.resolve(&request_id, response.clone()));
        assert!(!bookkeeper.resolve(&request_id, response));
        assert_eq!(bookkeeper.outstanding(), 0);
        assert_eq!(rx.recv().await.unwrap().payload, serde_json::json!("pong"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deadline_fires_timeout() {
        let bookkeeper = RequestBookkeeper::new();
        bookkeeper.start_scan();
        let (handler, mut rx) = collector();
        bookkeeper.track(
            Uuid::new_v4(),
            "o.f.s.svc",
            "Cap.op",
            Some(handler),
            Duration::from_millis(50),
            None,
        );
        let response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(response.has_error);
        let record: ErrorRecord = serde_json::from_value(response.payload).unwrap();
        assert_eq!(record.code, WireErrorCode::Timeout);
        assert_eq!(bookkeeper.outstanding(), 0);
        bookkeeper.stop_scan();
    }

    #[tokio::test]
    async fn shutdown_fails_everything_once() {
        let bookkeeper = RequestBookkeeper::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            bookkeeper.track(
                Uuid::new_v4(),
                "o.f.s.svc",
                "Cap.op",
                Some(Box::new(move |response| {
                    assert!(response.has_error);
                    fired.fetch_add(1, Ordering::SeqCst);
                })),
                Duration::from_secs(60),
                None,
            );
        }
        bookkeeper.fail_all_for_shutdown();
        bookkeeper.fail_all_for_shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
