//! Request/response correlation
//!
//! DoIP diagnostic messages carry no transaction id, so requests are
//! matched to responses by the expected response service id. To keep
//! that matching unambiguous only one request per service id may be in
//! flight at a time. Every registered request gets a process-local
//! monotonic correlation id; a response whose entry is gone (timed out,
//! cancelled) is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use doip_codec::{uds, DoipFrame, UdsReply};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::SessionError;
use crate::transport::FrameSink;

/// A matched UDS response handed back to the requester
#[derive(Debug, Clone)]
pub struct DiagnosticResponse {
    pub correlation_id: u64,
    pub reply: UdsReply,
    pub raw: Vec<u8>,
}

struct PendingEntry {
    request_sid: u8,
    waiter: oneshot::Sender<Result<DiagnosticResponse, SessionError>>,
}

#[derive(Default)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request for `sid` and return its correlation id plus
    /// the receiver the response will be delivered on.
    fn register(
        &self,
        sid: u8,
    ) -> Result<
        (
            u64,
            oneshot::Receiver<Result<DiagnosticResponse, SessionError>>,
        ),
        SessionError,
    > {
        let mut pending = self.pending.lock();
        if pending.values().any(|e| e.request_sid == sid) {
            return Err(SessionError::RequestInFlight(sid));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        pending.insert(
            id,
            PendingEntry {
                request_sid: sid,
                waiter: tx,
            },
        );
        Ok((id, rx))
    }

    /// Remove a pending entry. Returns false if it was already gone,
    /// which makes completion idempotent against late responses.
    fn complete(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Route an inbound UDS payload to its waiting requester. A 0x78
    /// response-pending reply keeps the entry alive; payloads that
    /// match no pending request are discarded.
    pub fn dispatch(&self, payload: &[u8]) {
        let reply = match UdsReply::classify(payload) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "dropping unclassifiable UDS payload");
                return;
            }
        };

        let mut pending = self.pending.lock();
        let matched = pending
            .iter()
            .find(|(_, e)| uds::answers(e.request_sid, payload))
            .map(|(id, _)| *id);

        let Some(id) = matched else {
            debug!(payload = %hex::encode(payload), "discarding uncorrelated response");
            return;
        };

        if reply.is_response_pending() {
            trace!(correlation_id = id, "response pending, keeping request open");
            return;
        }

        if let Some(entry) = pending.remove(&id) {
            let _ = entry.waiter.send(Ok(DiagnosticResponse {
                correlation_id: id,
                reply,
                raw: payload.to_vec(),
            }));
        }
    }

    /// Fail every pending request with `Cancelled`.
    pub fn cancel_all(&self) {
        for (_, entry) in self.pending.lock().drain() {
            let _ = entry.waiter.send(Err(SessionError::Cancelled));
        }
    }

    /// Fail every pending request because the transport died.
    pub fn fail_all(&self, reason: &str) {
        for (_, entry) in self.pending.lock().drain() {
            let _ = entry
                .waiter
                .send(Err(SessionError::ConnectionLost(reason.to_string())));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send a diagnostic request and await its correlated response
    /// within `deadline`. The pending entry is removed before this
    /// returns or is dropped, so a response arriving later finds no
    /// entry and is discarded.
    pub async fn send_and_wait(
        &self,
        sink: &Arc<dyn FrameSink>,
        source_addr: u16,
        target_addr: u16,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<DiagnosticResponse, SessionError> {
        let sid = *payload
            .first()
            .ok_or_else(|| SessionError::InvalidParameters("empty UDS request".into()))?;
        let (id, rx) = self.register(sid)?;
        let _guard = PendingGuard {
            correlator: self,
            id,
        };

        let frame = DoipFrame::diagnostic(source_addr, target_addr, payload);
        sink.send(frame).await?;

        match timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            // Waiter dropped without a verdict; treat as cancellation
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => {
                debug!(correlation_id = id, "request timed out");
                Err(SessionError::RequestTimeout)
            }
        }
    }
}

/// Clears the pending entry however `send_and_wait` ends, including
/// being dropped by an outer timeout. Removal is idempotent, so a
/// response that already resolved the entry is unaffected.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.complete(self.id);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use doip_codec::NegativeResponseCode;

    use super::*;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send(&self, _frame: DoipFrame) -> Result<(), SessionError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[test]
    fn correlation_ids_are_unique_and_increasing() {
        let correlator = Correlator::new();
        let (a, _rx_a) = correlator.register(0x10).unwrap();
        let (b, _rx_b) = correlator.register(0x22).unwrap();
        assert!(b > a);
    }

    #[test]
    fn one_request_per_service_id() {
        let correlator = Correlator::new();
        let (_, _rx) = correlator.register(0x10).unwrap();
        assert!(matches!(
            correlator.register(0x10),
            Err(SessionError::RequestInFlight(0x10))
        ));
    }

    #[tokio::test]
    async fn dispatch_resolves_matching_request() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register(0x10).unwrap();
        correlator.dispatch(&[0x50, 0x01]);
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.correlation_id, id);
        assert_eq!(response.raw, vec![0x50, 0x01]);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn negative_response_resolves_request() {
        let correlator = Correlator::new();
        let (_, rx) = correlator.register(0x27).unwrap();
        correlator.dispatch(&[0x7F, 0x27, 0x35]);
        let response = rx.await.unwrap().unwrap();
        assert_eq!(
            response.reply,
            UdsReply::Negative {
                sid: 0x27,
                nrc: NegativeResponseCode::InvalidKey
            }
        );
    }

    #[tokio::test]
    async fn response_pending_keeps_entry_alive() {
        let correlator = Correlator::new();
        let (_, rx) = correlator.register(0x31).unwrap();
        correlator.dispatch(&[0x7F, 0x31, 0x78]);
        assert_eq!(correlator.pending_count(), 1);
        correlator.dispatch(&[0x71, 0x01, 0x02, 0x03]);
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.raw, vec![0x71, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn uncorrelated_response_is_discarded() {
        let correlator = Correlator::new();
        let (_, _rx) = correlator.register(0x10).unwrap();
        correlator.dispatch(&[0x62, 0xF1, 0x90, 0x00]);
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn completion_is_idempotent() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.register(0x10).unwrap();
        assert!(correlator.complete(id));
        assert!(!correlator.complete(id));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_clears_pending_entry() {
        let correlator = Correlator::new();
        let sink: Arc<dyn FrameSink> = Arc::new(NullSink);
        let result = correlator
            .send_and_wait(&sink, 1, 2, vec![0x10, 0x01], Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(SessionError::RequestTimeout)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_clears_pending_entry() {
        let correlator = Correlator::new();
        let sink: Arc<dyn FrameSink> = Arc::new(NullSink);
        let wait = correlator.send_and_wait(&sink, 1, 2, vec![0x10, 0x01], Duration::from_secs(5));
        let result = timeout(Duration::from_millis(100), wait).await;
        assert!(result.is_err());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_all_fails_waiters() {
        let correlator = Correlator::new();
        let (_, rx) = correlator.register(0x10).unwrap();
        correlator.cancel_all();
        assert!(matches!(rx.await.unwrap(), Err(SessionError::Cancelled)));
        assert_eq!(correlator.pending_count(), 0);
    }
}
