//! Serialized Write Queue
//!
//! FIFO of pending cell writes with at most one write in flight. The queue
//! is owned by the device worker; nothing else touches it.
//!
//! ```text
//! enqueue ──► [ head | ... | tail ] ──► drain_once ──► Link::write
//!                                          │
//!                   fatal error / no link ─┴─► abort_all
//! ```

use super::transport::Link;
use crate::domain::braille::{encode, DotPattern};
use crate::error::SendError;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub type Completion = oneshot::Sender<Result<(), SendError>>;

/// One queued write and the channel its caller is waiting on.
#[derive(Debug)]
pub struct Job {
    pub pattern: DotPattern,
    completion: Completion,
}

impl Job {
    pub fn new(pattern: DotPattern) -> (Self, oneshot::Receiver<Result<(), SendError>>) {
        let (completion, done) = oneshot::channel();
        (
            Self {
                pattern,
                completion,
            },
            done,
        )
    }

    /// Consumes the job, so it can only ever be resolved once.
    pub fn resolve(self, result: Result<(), SendError>) {
        // The caller may have stopped waiting.
        let _ = self.completion.send(result);
    }
}

/// Result of one drain iteration.
///
/// On `NoLink` and `ConnectionLost` the head job is still queued; the
/// worker flips connection state first, then calls
/// [`Dispatcher::abort_all`] so callers never observe a failed job while
/// the device still reads as connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Idle,
    Written,
    WriteFailed,
    NoLink,
    ConnectionLost,
}

pub struct Dispatcher {
    queue: VecDeque<Job>,
    settle_delay: Duration,
    next_write_at: Instant,
}

impl Dispatcher {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            settle_delay,
            next_write_at: Instant::now(),
        }
    }

    pub fn enqueue(&mut self, job: Job) {
        trace!(pattern = %job.pattern, depth = self.queue.len(), "Job queued");
        self.queue.push_back(job);
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Earliest instant the device is ready for the next command.
    pub fn next_write_at(&self) -> Instant {
        self.next_write_at
    }

    /// Fail every queued job with `error`, head first. Returns how many
    /// jobs were failed.
    pub fn abort_all(&mut self, error: SendError) -> usize {
        let count = self.queue.len();
        for job in self.queue.drain(..) {
            job.resolve(Err(error.clone()));
        }
        if count > 0 {
            warn!(count, %error, "Aborted queued jobs");
        }
        count
    }

    /// Attempt the head job through `link`. `None` means the link is not
    /// valid right now.
    pub async fn drain_once<L: Link>(&mut self, link: Option<&L>) -> DrainOutcome {
        let Some(pattern) = self.queue.front().map(|job| job.pattern) else {
            return DrainOutcome::Idle;
        };
        let Some(link) = link else {
            return DrainOutcome::NoLink;
        };

        let byte = encode(pattern);
        debug!(%pattern, %byte, "Writing cell");
        let result = link.write(&[byte.value()]).await;
        self.next_write_at = Instant::now() + self.settle_delay;

        let outcome = match result {
            Ok(()) => {
                self.pop_and_resolve(Ok(()));
                DrainOutcome::Written
            }
            Err(e) if e.is_connection_fatal() => {
                warn!(error = %e, "Connection lost during write");
                return DrainOutcome::ConnectionLost;
            }
            Err(e) => {
                warn!(error = %e, %pattern, "Write failed, continuing with next job");
                self.pop_and_resolve(Err(SendError::WriteFailed(e.to_string())));
                DrainOutcome::WriteFailed
            }
        };

        if self.queue.is_empty() {
            debug!("Drain finished");
        }
        outcome
    }

    fn pop_and_resolve(&mut self, result: Result<(), SendError>) {
        if let Some(job) = self.queue.pop_front() {
            job.resolve(result);
        }
    }
}
