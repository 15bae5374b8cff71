//! FIFO of requests waiting for a credential to free up

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::dispatch::Fetched;
use crate::error::Result;

/// One inbound fetch with no response yet.
#[derive(Debug)]
pub struct PendingRequest {
    pub url: String,
    pub request_id: String,
    /// Position in line, assigned on first enqueue
    seq: u64,
    responder: oneshot::Sender<Result<Fetched>>,
}

impl PendingRequest {
    pub fn new(url: String, request_id: String) -> (Self, oneshot::Receiver<Result<Fetched>>) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                url,
                request_id,
                seq: 0,
                responder,
            },
            receiver,
        )
    }

    /// Deliver the final outcome to the waiting caller, consuming the request.
    pub fn respond(self, result: Result<Fetched>) {
        if self.responder.send(result).is_err() {
            debug!(request_id = %self.request_id, "caller went away before the response");
        }
    }

    /// The caller stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }
}

/// FIFO of pending requests, optionally bounded.
///
/// Each request is stamped with a sequence number when first enqueued.
/// Requests put back after a failed redrive are reinserted by that number
/// and ignore the bound, so they keep their place in line no matter how many
/// were popped in the same drain.
#[derive(Debug, Default)]
pub struct PendingQueue {
    inner: Mutex<VecDeque<PendingRequest>>,
    next_seq: AtomicU64,
    max_pending: Option<usize>,
}

impl PendingQueue {
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            max_pending,
        }
    }

    /// Append a request. Hands it back when the queue is full.
    pub fn enqueue(
        &self,
        mut request: PendingRequest,
    ) -> std::result::Result<usize, PendingRequest> {
        let mut queue = self.lock();
        if self.max_pending.is_some_and(|max| queue.len() >= max) {
            return Err(request);
        }
        request.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        queue.push_back(request);
        record_depth(queue.len());
        Ok(queue.len())
    }

    /// Put a popped request back at its original place in line.
    pub fn requeue(&self, request: PendingRequest) {
        let mut queue = self.lock();
        let at = queue.partition_point(|queued| queued.seq < request.seq);
        queue.insert(at, request);
        record_depth(queue.len());
    }

    /// Remove the oldest request whose caller is still waiting.
    pub fn pop_front(&self) -> Option<PendingRequest> {
        let mut queue = self.lock();
        let mut next = None;
        while let Some(request) = queue.pop_front() {
            if request.is_abandoned() {
                debug!(request_id = %request.request_id, "dropping abandoned queued request");
                continue;
            }
            next = Some(request);
            break;
        }
        record_depth(queue.len());
        next
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn max_pending(&self) -> Option<usize> {
        self.max_pending
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record_depth(depth: usize) {
    metrics::gauge!("pending_queue_depth").set(depth as f64);
}
