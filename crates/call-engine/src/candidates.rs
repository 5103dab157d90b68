//! FIFO buffering for remote candidates that arrive before the session
//! can apply them.

use std::collections::VecDeque;
use std::future::Future;
use std::mem;

use signal_store::CandidatePayload;
use tracing::warn;

use crate::error::CallResult;

/// Holds remote candidates until both descriptions are in place.
/// Draining is best-effort per candidate: one bad record never blocks
/// the rest.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<CandidatePayload>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: CandidatePayload) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Replays buffered candidates in arrival order and leaves the
    /// buffer empty, so a second drain sees nothing. Individual
    /// failures are logged and skipped. Returns how many candidates
    /// applied cleanly.
    pub async fn drain<F, Fut>(&mut self, mut apply: F) -> usize
    where
        F: FnMut(CandidatePayload) -> Fut,
        Fut: Future<Output = CallResult<()>>,
    {
        let pending = mem::take(&mut self.queue);
        let mut applied = 0usize;
        for candidate in pending {
            match apply(candidate).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!(error = %err, "buffered candidate failed to apply, skipping");
                }
            }
        }
        applied
    }
}
