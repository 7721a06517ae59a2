//! Request/response correlation for worker RPCs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::RequestError;

struct PendingEntry<T> {
    tx: oneshot::Sender<Result<T, RequestError>>,
    created_at: Instant,
}

/// Receiving half of a registered request.
pub struct PendingReply<T> {
    request_id: u64,
    rx: oneshot::Receiver<Result<T, RequestError>>,
}

impl<T> PendingReply<T> {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

/// Outstanding requests keyed by request id.
///
/// Ids start at 1 and strictly increase for the lifetime of the table, so a
/// late reply can never be matched to a newer request.
pub struct PendingRequests<T> {
    next_id: AtomicU64,
    entries: DashMap<u64, PendingEntry<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    /// Allocate a request id and its reply slot.
    pub fn register(&self) -> PendingReply<T> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            request_id,
            PendingEntry {
                tx,
                created_at: Instant::now(),
            },
        );
        PendingReply { request_id, rx }
    }

    /// Wait for the reply.
    ///
    /// The entry is gone once this returns or the future is dropped, so a
    /// caller that gives up early leaves nothing behind.
    pub async fn wait(&self, reply: PendingReply<T>, timeout: Duration) -> Result<T, RequestError> {
        let PendingReply { request_id, rx } = reply;
        let _registration = Registration {
            table: self,
            request_id,
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Terminated),
            Err(_) => {
                debug!(request_id, ?timeout, "Request timed out");
                Err(RequestError::Timeout {
                    request_id,
                    after: timeout,
                })
            }
        }
    }

    /// Deliver a reply. Returns false for unknown or already settled ids.
    pub fn complete(&self, request_id: u64, result: Result<T, RequestError>) -> bool {
        match self.entries.remove(&request_id) {
            Some((_, entry)) => {
                trace!(request_id, elapsed = ?entry.created_at.elapsed(), "Request settled");
                // The caller may have stopped waiting; that is fine.
                let _ = entry.tx.send(result);
                true
            }
            None => {
                debug!(request_id, "Reply for unknown request ignored");
                false
            }
        }
    }

    /// Drop a registration without replying.
    pub fn cancel(&self, request_id: u64) {
        self.entries.remove(&request_id);
    }

    /// Settle every outstanding request with `err`.
    pub fn reject_all(&self, err: RequestError) -> usize {
        let ids: Vec<u64> = self.entries.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for request_id in ids {
            if let Some((_, entry)) = self.entries.remove(&request_id) {
                let _ = entry.tx.send(Err(err.clone()));
                rejected += 1;
            }
        }
        rejected
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Removes a request's entry when its waiter goes away.
struct Registration<'a, T> {
    table: &'a PendingRequests<T>,
    request_id: u64,
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        if self.table.entries.remove(&self.request_id).is_some() {
            trace!(request_id = self.request_id, "Abandoned request removed");
        }
    }
}
