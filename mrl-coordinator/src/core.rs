//! The job coordinator: drives one job from pre-flight to promotion.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::select;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use common::error::error_chain;
use common::storage::Storage;
use common::utils::join_path;
use common::{MrError, Result, Workload};
use mrl_worker::map::aux_bytes;
use mrl_worker::output::{attempt_path, final_path, temporary_dir, SUCCESS_MARKER};
use mrl_worker::{split, ShuffleEngine};

use crate::config::{JobConfig, OutputPolicy};
use crate::jobs::{Job, JobState};
use crate::phases::{MapPhase, ReducePhase};
use crate::report::{Counters, JobFailure, JobReport, ReportedError};
use crate::scheduler::Scheduler;
use crate::tasks::{TaskKind, TaskTable};

/// Cancels a running job from the outside.
#[derive(Debug, Clone)]
pub struct JobHandle {
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
pub struct JobCoordinator {
    storage: Arc<dyn Storage>,
    config: JobConfig,
    workload: Option<Workload>,
    cancel: CancellationToken,
}

/// Everything one run accumulates, kept apart from the coordinator so that
/// cleanup and reporting can see it whichever way the run ended.
struct JobRun {
    job: Job,
    tasks: TaskTable,
    counters: Arc<Counters>,
    shuffle: Option<Arc<ShuffleEngine>>,
    output_claimed: bool,
    outputs: Vec<String>,
}

impl JobCoordinator {
    pub fn new(storage: Arc<dyn Storage>, config: JobConfig) -> Self {
        Self {
            storage,
            config,
            workload: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Run `workload` instead of the built-in one named in the config.
    pub fn with_workload(mut self, workload: Workload) -> Self {
        self.workload = Some(workload);
        self
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Run the job to completion. Failures end up in the report.
    pub async fn run(self) -> JobReport {
        let started = Instant::now();
        let mut run = JobRun {
            job: Job::new(),
            tasks: TaskTable::new(),
            counters: Arc::new(Counters::default()),
            shuffle: None,
            output_claimed: false,
            outputs: Vec::new(),
        };
        let span = info_span!("job", id = %run.job.id());

        let result = self.execute(&mut run).instrument(span.clone()).await;
        self.cleanup(&mut run, result.is_ok())
            .instrument(span.clone())
            .await;

        let error = match result {
            Ok(()) => None,
            Err(failure) => {
                span.in_scope(|| error!("job {} failed: {}", run.job.id(), error_chain(&failure)));
                if let Err(e) = run.job.transition(JobState::Failed) {
                    warn!("{e}");
                }
                Some(ReportedError::from(&failure))
            }
        };

        JobReport {
            job_id: run.job.id().to_string(),
            user: self.config.user.clone(),
            workload: self.config.workload.clone(),
            state: run.job.state(),
            error,
            counters: run.counters.snapshot(),
            tasks: run.tasks.snapshot(),
            failures: run.tasks.failures(),
            outputs: run.outputs,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn execute(&self, run: &mut JobRun) -> std::result::Result<(), JobFailure> {
        self.config.validate()?;
        let workload = match self.workload {
            Some(workload) => workload,
            None => self.config.resolve_workload()?,
        };
        let aux = aux_bytes(&self.config.aux);
        info!(
            "job {} submitted by {}: {} {} -> {}",
            run.job.id(),
            self.config.user,
            self.config.workload,
            self.config.input,
            self.config.output
        );

        self.checkpoint()?;
        self.claim_output().await?;
        run.output_claimed = true;

        run.job.transition(JobState::Splitting)?;
        let splits = select! {
            _ = self.cancel.cancelled() => return Err(MrError::Cancelled.into()),
            splits = split(
                self.storage.as_ref(),
                &self.config.input,
                self.config.split_size.as_u64(),
            ) => splits?,
        };
        let map_count = splits.len();
        let reduce_count = self.config.reduce_count as usize;

        run.job.transition(JobState::Mapping)?;
        let shuffle = Arc::new(ShuffleEngine::new(
            run.job.id(),
            &self.config.spill_dir,
            map_count,
            self.config.reduce_count,
            self.config.spill_threshold.as_u64() as usize,
            self.config.shuffle_io_retries,
        )?);
        run.shuffle = Some(shuffle.clone());
        run.tasks.insert_pending(TaskKind::Map, map_count);
        run.tasks.insert_pending(TaskKind::Reduce, reduce_count);

        let scheduler = Scheduler {
            tasks: &run.tasks,
            counters: &run.counters,
            permits: Arc::new(Semaphore::new(self.config.parallelism)),
            max_attempts: self.config.max_attempts,
            task_timeout: self.config.task_timeout,
            retry_backoff: self.config.retry_backoff,
            cancel: &self.cancel,
        };

        let map = Arc::new(MapPhase {
            storage: self.storage.clone(),
            splits,
            shuffle: shuffle.clone(),
            workload,
            aux: aux.clone(),
            counters: run.counters.clone(),
        });
        scheduler.run_phase(map, map_count).await?;

        run.job.transition(JobState::ShuffleBarrier)?;
        if !run.tasks.all_succeeded(TaskKind::Map) {
            return Err(MrError::Internal("map phase ended with unfinished tasks".into()).into());
        }
        shuffle.verify_ready()?;
        debug!(
            "shuffle ready: {} records in {} spills",
            shuffle.committed_records(),
            shuffle.committed_spills()
        );

        self.checkpoint()?;
        run.job.transition(JobState::Reducing)?;
        let reduce = Arc::new(ReducePhase {
            storage: self.storage.clone(),
            output: self.config.output.clone(),
            shuffle: shuffle.clone(),
            workload,
            aux,
            counters: run.counters.clone(),
            accepted: DashMap::new(),
        });
        scheduler.run_phase(reduce.clone(), reduce_count).await?;

        self.checkpoint()?;
        run.outputs = self.promote(&reduce).await?;
        run.job.transition(JobState::Completed)?;
        info!("job {} completed", run.job.id());
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MrError::Cancelled);
        }
        Ok(())
    }

    /// Make sure the output path is ours before any task runs.
    async fn claim_output(&self) -> Result<()> {
        let output = &self.config.output;
        if self.storage.exists(output).await? {
            match self.config.output_policy {
                OutputPolicy::Fail => {
                    return Err(MrError::OutputConflict {
                        path: output.clone(),
                    })
                }
                OutputPolicy::Overwrite => {
                    warn!("overwriting existing output {output}");
                    self.storage.delete(output, true).await?;
                }
            }
        }
        self.storage.mkdirs(output).await?;
        Ok(())
    }

    /// Move every partition's accepted attempt to its final name.
    async fn promote(&self, reduce: &ReducePhase) -> Result<Vec<String>> {
        let output = &self.config.output;
        let mut outputs = Vec::with_capacity(self.config.reduce_count as usize);

        for partition in 0..self.config.reduce_count {
            let attempt = reduce
                .accepted_attempt(partition as usize)
                .ok_or_else(|| MrError::Internal(format!("partition {partition} has no output")))?;
            let from = attempt_path(output, partition, attempt);
            let to = final_path(output, partition);
            if !self.storage.rename(&from, &to).await? {
                return Err(MrError::Internal(format!("attempt output {from} is missing")));
            }
            debug!("promoted {from} to {to}");
            outputs.push(to);
        }

        self.storage.delete(&temporary_dir(output), true).await?;
        let marker = self.storage.create(&join_path(output, SUCCESS_MARKER)).await?;
        marker.finish().await?;
        Ok(outputs)
    }

    async fn cleanup(&self, run: &mut JobRun, succeeded: bool) {
        if let Some(shuffle) = run.shuffle.take() {
            shuffle.cleanup();
        }
        if succeeded || !run.output_claimed {
            return;
        }

        let output = &self.config.output;
        match self.storage.delete(output, true).await {
            Ok(_) => debug!("removed partial output {output}"),
            Err(e) => warn!("could not remove partial output {output}: {}", error_chain(&e)),
        }
    }
}
