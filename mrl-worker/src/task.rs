use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use common::{MrError, Result};

const NOT_STARTED: u64 = u64::MAX;

#[derive(Debug)]
struct Heartbeat {
    started: Instant,

    /// Milliseconds since `started` at the last tick, `NOT_STARTED` before
    /// the first one.
    last: AtomicU64,
}

/// Liveness and cancellation shared between one task attempt and its
/// supervisor.
///
/// The attempt calls [`TaskContext::tick`] as it makes progress, the
/// supervisor reads [`TaskContext::since_last`] and cancels the token when
/// the attempt went quiet for too long.
#[derive(Debug, Clone)]
pub struct TaskContext {
    heartbeat: Arc<Heartbeat>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            heartbeat: Arc::new(Heartbeat {
                started: Instant::now(),
                last: AtomicU64::new(NOT_STARTED),
            }),
            cancel,
        }
    }

    /// Record progress. Fails with [`MrError::Cancelled`] once the attempt
    /// has been cancelled, so task loops stop at their next step.
    pub fn tick(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MrError::Cancelled);
        }
        let now = self.heartbeat.started.elapsed().as_millis() as u64;
        self.heartbeat.last.store(now, Ordering::Relaxed);
        Ok(())
    }

    /// Time since the last tick. An attempt that never ticked (still queued
    /// for a permit or backing off) has not gone silent yet.
    pub fn since_last(&self) -> Duration {
        match self.heartbeat.last.load(Ordering::Relaxed) {
            NOT_STARTED => Duration::ZERO,
            last => self
                .heartbeat
                .started
                .elapsed()
                .saturating_sub(Duration::from_millis(last)),
        }
    }

    pub fn has_started(&self) -> bool {
        self.heartbeat.last.load(Ordering::Relaxed) != NOT_STARTED
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_resets_the_silence() {
        let ctx = TaskContext::new(CancellationToken::new());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!ctx.has_started());
        assert_eq!(ctx.since_last(), Duration::ZERO);

        ctx.tick().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(ctx.since_last() >= Duration::from_millis(19));
        ctx.tick().unwrap();
        assert!(ctx.since_last() < Duration::from_millis(20));
    }

    #[test]
    fn tick_fails_after_cancel() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new(token.child_token());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.tick(), Err(MrError::Cancelled)));
    }
}
