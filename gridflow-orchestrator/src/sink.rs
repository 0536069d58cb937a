//! Caller-facing result plumbing.
//!
//! Every submitted operation gets a [`ResultSink`] (held by whichever grouping
//! structure owns the operation) and an [`OperationHandle`] (held by the
//! caller). Dropping or cancelling the handle withdraws interest: grouping
//! structures check [`ResultSink::is_cancelled`] before spending an upstream
//! call on it.

use gridflow_core::{Fingerprint, OperationError, OperationKind, OrchestratorError, Payload};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{oneshot, OwnedSemaphorePermit};

use crate::metrics::prometheus as prom;

/// What a caller eventually receives.
pub type OperationResult = Result<Payload, OperationError>;

/// Producer side of one caller's result.
#[derive(Debug)]
pub struct ResultSink {
    fingerprint: Fingerprint,
    kind: OperationKind,
    submitted_at: Instant,
    tx: oneshot::Sender<OperationResult>,
    // Pending-operation slot, released when the sink is resolved or dropped
    _slot: Option<OwnedSemaphorePermit>,
}

impl ResultSink {
    pub fn new(
        fingerprint: Fingerprint,
        kind: OperationKind,
        slot: Option<OwnedSemaphorePermit>,
    ) -> (Self, OperationHandle) {
        let (tx, rx) = oneshot::channel();
        let sink = Self { fingerprint, kind, submitted_at: Instant::now(), tx, _slot: slot };
        (sink, OperationHandle { fingerprint, rx })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The caller dropped or cancelled its handle.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Deliver the outcome. A caller that has gone away is ignored.
    pub fn resolve(self, result: Result<Payload, OrchestratorError>) {
        let status = match &result {
            Ok(_) => "ok",
            Err(err) => err.label(),
        };
        prom::record_operation(self.kind.as_str(), status);
        tracing::trace!(
            fingerprint = %self.fingerprint,
            status,
            elapsed_ms = self.submitted_at.elapsed().as_millis() as u64,
            "Operation resolved"
        );

        let fingerprint = self.fingerprint;
        let _ = self
            .tx
            .send(result.map_err(|error| OperationError::new(fingerprint, error)));
    }
}

/// The caller's handle to a submitted operation.
///
/// Resolves to the operation's result. Dropping the handle (or calling
/// [`cancel`](Self::cancel)) withdraws interest; an operation already grouped
/// with others still runs for the remaining members.
#[derive(Debug)]
pub struct OperationHandle {
    fingerprint: Fingerprint,
    rx: oneshot::Receiver<OperationResult>,
}

impl OperationHandle {
    /// A handle that is already resolved with a failure.
    pub fn failed(fingerprint: Fingerprint, error: OrchestratorError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(OperationError::new(fingerprint, error)));
        Self { fingerprint, rx }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Future for OperationHandle {
    type Output = OperationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let fingerprint = self.fingerprint;
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(OperationError::new(fingerprint, OrchestratorError::Cancelled))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp() -> Fingerprint {
        Fingerprint::from_raw(42)
    }

    #[tokio::test]
    async fn test_resolve_delivers_result() {
        let (sink, handle) = ResultSink::new(fp(), OperationKind::Read, None);
        sink.resolve(Ok(Payload::Json(json!(1))));
        assert_eq!(handle.await.unwrap(), Payload::Json(json!(1)));
    }

    #[tokio::test]
    async fn test_error_carries_fingerprint() {
        let (sink, handle) = ResultSink::new(fp(), OperationKind::Write, None);
        sink.resolve(Err(OrchestratorError::Shutdown));
        let err = handle.await.unwrap_err();
        assert_eq!(err.fingerprint, fp());
        assert_eq!(err.error, OrchestratorError::Shutdown);
    }

    #[tokio::test]
    async fn test_cancel_is_visible_to_sink() {
        let (sink, handle) = ResultSink::new(fp(), OperationKind::Read, None);
        assert!(!sink.is_cancelled());
        handle.cancel();
        assert!(sink.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_sink_reports_cancelled() {
        let (sink, handle) = ResultSink::new(fp(), OperationKind::Read, None);
        drop(sink);
        assert_eq!(handle.await.unwrap_err().error, OrchestratorError::Cancelled);
    }

    #[tokio::test]
    async fn test_slot_released_on_resolve() {
        let slots = std::sync::Arc::new(tokio::sync::Semaphore::new(1));
        let permit = slots.clone().try_acquire_owned().unwrap();
        let (sink, _handle) = ResultSink::new(fp(), OperationKind::Read, Some(permit));
        assert_eq!(slots.available_permits(), 0);
        sink.resolve(Ok(Payload::Empty));
        assert_eq!(slots.available_permits(), 1);
    }
}
