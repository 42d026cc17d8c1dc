//! Runs one phase of a job: every task of the phase, each attempt watched
//! for silence, each failure retried until the task runs out of attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use common::error::error_chain;
use common::{MrError, Result};
use mrl_worker::TaskContext;

use crate::report::{Counters, JobFailure};
use crate::tasks::{Retry, TaskId, TaskKind, TaskTable};

/// The tasks of one phase, as the scheduler sees them.
#[async_trait]
pub(crate) trait PhaseTask: Send + Sync + 'static {
    type Output: Send + 'static;

    const KIND: TaskKind;

    /// Run one attempt of task `index`.
    async fn launch(
        self: Arc<Self>,
        index: usize,
        attempt: u32,
        ctx: TaskContext,
    ) -> Result<Self::Output>;

    /// Keep the output of the task's successful attempt.
    async fn accept(&self, index: usize, attempt: u32, output: Self::Output) -> Result<()>;

    /// Delete whatever a failed or abandoned attempt left behind.
    async fn discard(&self, index: usize, attempt: u32);
}

pub(crate) struct Scheduler<'a> {
    pub tasks: &'a TaskTable,
    pub counters: &'a Counters,
    pub permits: Arc<Semaphore>,
    pub max_attempts: u32,
    pub task_timeout: Duration,
    pub retry_backoff: Duration,
    pub cancel: &'a CancellationToken,
}

struct Running {
    attempt: u32,
    ctx: TaskContext,
}

type Finished<O> = (usize, u32, Result<O>);

enum Settled {
    Done,
    Retry,
    Ignored,
}

impl Scheduler<'_> {
    /// Run tasks `0..count` of `phase` until every one of them succeeded.
    pub async fn run_phase<T: PhaseTask>(
        &self,
        phase: Arc<T>,
        count: usize,
    ) -> std::result::Result<(), JobFailure> {
        let phase_token = self.cancel.child_token();
        let mut attempts: JoinSet<Finished<T::Output>> = JoinSet::new();
        let mut running: HashMap<usize, Running> = HashMap::new();
        let mut remaining = count;

        info!("starting {count} {:?} tasks", T::KIND);
        for index in 0..count {
            self.launch(
                &phase,
                index,
                Duration::ZERO,
                &phase_token,
                &mut attempts,
                &mut running,
            )?;
        }

        let mut ticker = tokio::time::interval(self.task_timeout / 4);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = 'phase: loop {
            if remaining == 0 {
                break Ok(());
            }

            let retry = select! {
                _ = self.cancel.cancelled() => {
                    warn!("{:?} phase cancelled", T::KIND);
                    break Err(MrError::Cancelled.into());
                }
                Some(joined) = attempts.join_next() => {
                    let (index, attempt, result) = match joined {
                        Ok(finished) => finished,
                        Err(e) => {
                            break Err(MrError::Internal(format!("task attempt aborted: {e}")).into())
                        }
                    };
                    match self.settle(&phase, index, attempt, result, &mut running).await {
                        Ok(Settled::Done) => {
                            remaining -= 1;
                            vec![]
                        }
                        Ok(Settled::Retry) => vec![index],
                        Ok(Settled::Ignored) => vec![],
                        Err(failure) => break Err(failure),
                    }
                }
                _ = ticker.tick() => {
                    match self.check_liveness::<T>(&mut running) {
                        Ok(retry) => retry,
                        Err(failure) => break Err(failure),
                    }
                }
            };

            for index in retry {
                if let Err(e) = self.launch(
                    &phase,
                    index,
                    self.backoff(),
                    &phase_token,
                    &mut attempts,
                    &mut running,
                ) {
                    break 'phase Err(e.into());
                }
            }
        };

        phase_token.cancel();
        self.drain(&phase, &mut attempts).await;

        if outcome.is_ok() {
            info!("{:?} phase finished", T::KIND);
        }
        outcome
    }

    fn backoff(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        self.retry_backoff.mul_f64(jitter)
    }

    fn launch<T: PhaseTask>(
        &self,
        phase: &Arc<T>,
        index: usize,
        delay: Duration,
        phase_token: &CancellationToken,
        attempts: &mut JoinSet<Finished<T::Output>>,
        running: &mut HashMap<usize, Running>,
    ) -> Result<()> {
        let id = TaskId::new(T::KIND, index);
        let attempt = self.tasks.start_attempt(id)?;
        let ctx = TaskContext::new(phase_token.child_token());
        running.insert(
            index,
            Running {
                attempt,
                ctx: ctx.clone(),
            },
        );
        debug!("scheduling {id} attempt {attempt} after {delay:?}");

        let phase = phase.clone();
        let permits = self.permits.clone();
        let span = info_span!("attempt", task = %id, attempt);
        attempts.spawn(
            async move {
                if !delay.is_zero() {
                    select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel_token().cancelled() => {}
                    }
                }
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => match ctx.tick() {
                        Ok(()) => phase.launch(index, attempt, ctx).await,
                        Err(e) => Err(e),
                    },
                    Err(_) => Err(MrError::Cancelled),
                };
                (index, attempt, result)
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn settle<T: PhaseTask>(
        &self,
        phase: &Arc<T>,
        index: usize,
        attempt: u32,
        result: Result<T::Output>,
        running: &mut HashMap<usize, Running>,
    ) -> std::result::Result<Settled, JobFailure> {
        let id = TaskId::new(T::KIND, index);
        if running.get(&index).map(|r| r.attempt) != Some(attempt) {
            debug!("{id} attempt {attempt} finished after it was abandoned, discarding");
            Counters::add(&self.counters.discarded_attempts, 1);
            phase.discard(index, attempt).await;
            return Ok(Settled::Ignored);
        }
        running.remove(&index);

        match result {
            Ok(output) => {
                if !self.tasks.succeed(id, attempt) {
                    phase.discard(index, attempt).await;
                    return Ok(Settled::Ignored);
                }
                phase.accept(index, attempt, output).await?;
                debug!("{id} attempt {attempt} succeeded");
                Ok(Settled::Done)
            }
            Err(e) if e.is_fatal() => {
                phase.discard(index, attempt).await;
                Err(e.into())
            }
            Err(e) => {
                warn!("{id} attempt {attempt} failed: {}", error_chain(&e));
                Counters::add(&self.counters.failed_attempts, 1);
                phase.discard(index, attempt).await;
                self.retry(id, attempt, &e)
            }
        }
    }

    /// Abandon attempts that have been silent for longer than the task
    /// timeout. Returns the tasks to run again.
    fn check_liveness<T: PhaseTask>(
        &self,
        running: &mut HashMap<usize, Running>,
    ) -> std::result::Result<Vec<usize>, JobFailure> {
        let silent: Vec<(usize, u32)> = running
            .iter()
            .filter(|(_, r)| r.ctx.since_last() > self.task_timeout)
            .map(|(index, r)| (*index, r.attempt))
            .collect();

        let mut retry = Vec::new();
        for (index, attempt) in silent {
            if let Some(abandoned) = running.remove(&index) {
                abandoned.ctx.cancel_token().cancel();
            }
            let id = TaskId::new(T::KIND, index);
            let timeout = MrError::TaskTimeout {
                task: id.to_string(),
                attempt,
                after: self.task_timeout,
            };
            warn!("{timeout}");
            Counters::add(&self.counters.timed_out_attempts, 1);
            if let Settled::Retry = self.retry(id, attempt, &timeout)? {
                retry.push(index);
            }
        }
        Ok(retry)
    }

    fn retry(
        &self,
        id: TaskId,
        attempt: u32,
        error: &MrError,
    ) -> std::result::Result<Settled, JobFailure> {
        match self.tasks.fail(id, attempt, error, self.max_attempts) {
            Retry::Again => Ok(Settled::Retry),
            Retry::Stale => Ok(Settled::Ignored),
            Retry::Exhausted => {
                error!("{id} failed {} times, giving up", self.max_attempts);
                let failures = self.tasks.get(id).map(|t| t.failures).unwrap_or_default();
                Err(JobFailure::RetriesExhausted { task: id, failures })
            }
        }
    }

    /// Wait a while for attempts still in flight to notice the phase is
    /// over, discarding whatever they produce.
    async fn drain<T: PhaseTask>(
        &self,
        phase: &Arc<T>,
        attempts: &mut JoinSet<Finished<T::Output>>,
    ) {
        if attempts.is_empty() {
            return;
        }
        debug!("waiting for {} attempts to stop", attempts.len());

        let stopped = tokio::time::timeout(self.task_timeout, async {
            while let Some(joined) = attempts.join_next().await {
                if let Ok((index, attempt, _)) = joined {
                    phase.discard(index, attempt).await;
                }
            }
        })
        .await;

        if stopped.is_err() {
            warn!(
                "{} attempts did not stop in time, leaving them behind",
                attempts.len()
            );
            attempts.abort_all();
        }
    }
}
