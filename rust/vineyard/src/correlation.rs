//! Request correlation: matching responses to waiting callers by opaque.
//!
//! One table per client connection. Callers register before writing a
//! request and await the returned [`ResponseHandle`]; the connection task
//! completes entries as responses arrive and fails all of them when the
//! connection goes away.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use vineyard_wire::Response;

use crate::CallError;

/// Longest timeout a call can have: the wire carries it as `i32`
/// milliseconds. Longer timeouts are clamped to this.
pub const MAX_CALL_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

type Slot = oneshot::Sender<Result<Response, CallError>>;

struct PendingCall {
    /// Distinguishes registrations that reused the same opaque.
    id: u64,
    deadline: Instant,
    timeout: Duration,
    slot: Slot,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<i32, PendingCall>,
    closed: bool,
}

pub struct CorrelationTable {
    next_opaque: AtomicI32,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self {
            next_opaque: AtomicI32::new(1),
            next_id: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next opaque: positive, never 0, wrapping back to 1 after `i32::MAX`.
    pub fn next_opaque(&self) -> i32 {
        let prev = self
            .next_opaque
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(if cur >= i32::MAX || cur < 1 { 1 } else { cur + 1 })
            })
            .unwrap_or(1);
        if prev < 1 { 1 } else { prev }
    }

    /// Register a call under a fresh opaque.
    pub fn register(self: &Arc<Self>, timeout: Duration) -> Result<ResponseHandle, CallError> {
        let opaque = self.next_opaque();
        self.register_with_opaque(opaque, timeout)
    }

    /// Register a call under a caller-chosen opaque.
    ///
    /// An earlier call still waiting on the same opaque is failed with
    /// [`CallError::Superseded`]. `timeout` is clamped to
    /// [`MAX_CALL_TIMEOUT`].
    pub fn register_with_opaque(
        self: &Arc<Self>,
        opaque: i32,
        timeout: Duration,
    ) -> Result<ResponseHandle, CallError> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = timeout.min(MAX_CALL_TIMEOUT);
        let deadline = Instant::now() + timeout;

        let shadowed = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(CallError::ConnectionClosed);
            }
            inner.pending.insert(
                opaque,
                PendingCall {
                    id,
                    deadline,
                    timeout,
                    slot: tx,
                },
            )
        };
        if let Some(old) = shadowed {
            tracing::warn!(opaque, "opaque reused while a call was pending");
            let _ = old.slot.send(Err(CallError::Superseded { opaque }));
        }

        Ok(ResponseHandle {
            opaque,
            id,
            deadline,
            timeout,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Hand a response to its caller. Returns `false` if nobody was waiting.
    pub fn complete(&self, response: Response) -> bool {
        let opaque = response.opaque;
        let Some(call) = self.inner.lock().pending.remove(&opaque) else {
            tracing::debug!(opaque, "discarding response with no pending call");
            return false;
        };
        if call.slot.send(Ok(response)).is_err() {
            tracing::debug!(opaque, "caller went away before its response arrived");
        }
        true
    }

    /// Fail one pending call.
    pub fn fail(&self, opaque: i32, error: CallError) -> bool {
        let Some(call) = self.inner.lock().pending.remove(&opaque) else {
            return false;
        };
        let _ = call.slot.send(Err(error));
        true
    }

    /// Fail every call whose deadline has passed. Returns how many expired.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(i32, PendingCall)> = {
            let mut inner = self.inner.lock();
            let overdue: Vec<i32> = inner
                .pending
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(opaque, _)| *opaque)
                .collect();
            overdue
                .into_iter()
                .filter_map(|opaque| inner.pending.remove(&opaque).map(|call| (opaque, call)))
                .collect()
        };
        let count = expired.len();
        for (opaque, call) in expired {
            tracing::debug!(opaque, timeout = ?call.timeout, "call expired");
            let _ = call.slot.send(Err(CallError::Timeout {
                opaque,
                timeout: call.timeout,
            }));
        }
        count
    }

    /// Fail everything with [`CallError::ConnectionClosed`] and refuse new
    /// registrations.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.pending.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.slot.send(Err(CallError::ConnectionClosed));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Drop the entry for `opaque` if it still belongs to registration `id`.
    fn forget(&self, opaque: i32, id: u64) {
        let mut inner = self.inner.lock();
        if inner.pending.get(&opaque).is_some_and(|call| call.id == id) {
            inner.pending.remove(&opaque);
        }
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CorrelationTable")
            .field("pending", &inner.pending.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// The caller's side of a pending call.
///
/// Dropping the handle abandons the call; a response arriving later is
/// discarded.
#[derive(Debug)]
pub struct ResponseHandle {
    opaque: i32,
    id: u64,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Response, CallError>>,
    table: Arc<CorrelationTable>,
}

impl ResponseHandle {
    pub fn opaque(&self) -> i32 {
        self.opaque
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The effective timeout, after clamping.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the response, at most until the deadline.
    pub async fn wait(mut self) -> Result<Response, CallError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // The table dropped the slot without answering.
            Ok(Err(_)) => Err(CallError::ConnectionClosed),
            Err(_) => Err(CallError::Timeout {
                opaque: self.opaque,
                timeout: self.timeout,
            }),
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.table.forget(self.opaque, self.id);
    }
}
