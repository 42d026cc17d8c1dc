//! What a finished job reports back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;

use common::error::error_chain;
use common::{ErrorKind, MrError};

use crate::jobs::JobState;
use crate::tasks::{TaskId, TaskInfo};

/// One failed task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub task: TaskId,
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(task: TaskId, attempt: u32, error: &MrError) -> Self {
        Self {
            task,
            attempt,
            kind: error.kind(),
            message: error_chain(error),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} attempt {}: {}", self.task, self.attempt, self.message)
    }
}

/// Why a job failed.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error(transparent)]
    Error(#[from] MrError),

    #[error("task {task} used up its attempts ({} failures)", .failures.len())]
    RetriesExhausted {
        task: TaskId,
        failures: Vec<TaskFailure>,
    },
}

impl JobFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobFailure::Error(e) => e.kind(),
            JobFailure::RetriesExhausted { failures, .. } => failures
                .last()
                .map(|f| f.kind)
                .unwrap_or(ErrorKind::Internal),
        }
    }
}

/// Job counters, updated by the task attempts as they are accepted.
#[derive(Debug, Default)]
pub struct Counters {
    pub map_input_records: AtomicU64,
    pub map_output_records: AtomicU64,
    pub spills: AtomicU64,
    pub reduce_groups: AtomicU64,
    pub reduce_input_records: AtomicU64,
    pub reduce_output_records: AtomicU64,
    pub output_bytes: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub timed_out_attempts: AtomicU64,
    pub discarded_attempts: AtomicU64,
}

impl Counters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            map_input_records: get(&self.map_input_records),
            map_output_records: get(&self.map_output_records),
            spills: get(&self.spills),
            reduce_groups: get(&self.reduce_groups),
            reduce_input_records: get(&self.reduce_input_records),
            reduce_output_records: get(&self.reduce_output_records),
            output_bytes: get(&self.output_bytes),
            failed_attempts: get(&self.failed_attempts),
            timed_out_attempts: get(&self.timed_out_attempts),
            discarded_attempts: get(&self.discarded_attempts),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub map_input_records: u64,
    pub map_output_records: u64,
    pub spills: u64,
    pub reduce_groups: u64,
    pub reduce_input_records: u64,
    pub reduce_output_records: u64,
    pub output_bytes: u64,
    pub failed_attempts: u64,
    pub timed_out_attempts: u64,
    pub discarded_attempts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&JobFailure> for ReportedError {
    fn from(failure: &JobFailure) -> Self {
        Self {
            kind: failure.kind(),
            message: error_chain(failure),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub user: String,
    pub workload: String,
    pub state: JobState,
    pub error: Option<ReportedError>,
    pub counters: CounterSnapshot,
    pub tasks: Vec<TaskInfo>,

    /// Every failed attempt, ordered by task and attempt.
    pub failures: Vec<TaskFailure>,

    /// Promoted output files.
    pub outputs: Vec<String>,
    pub elapsed_ms: u64,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "job {} ({}) {} in {}ms",
            self.job_id, self.workload, self.state, self.elapsed_ms
        )?;
        if let Some(error) = &self.error {
            writeln!(f, "  error: {}", error.message)?;
        }
        let c = &self.counters;
        writeln!(
            f,
            "  map: {} records in, {} out, {} spills",
            c.map_input_records, c.map_output_records, c.spills
        )?;
        writeln!(
            f,
            "  reduce: {} groups, {} records in, {} out, {} bytes",
            c.reduce_groups, c.reduce_input_records, c.reduce_output_records, c.output_bytes
        )?;
        if !self.failures.is_empty() {
            writeln!(
                f,
                "  failed attempts:\n    {}",
                self.failures.iter().join("\n    ")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskKind;

    #[test]
    fn exhausted_retries_report_the_last_kind() {
        let task = TaskId::new(TaskKind::Map, 2);
        let failures = vec![
            TaskFailure::new(task, 1, &MrError::Internal("first".into())),
            TaskFailure::new(task, 2, &MrError::Cancelled),
        ];
        let failure = JobFailure::RetriesExhausted { task, failures };
        assert_eq!(failure.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ReportedError::from(&failure).message,
            "task map-0002 used up its attempts (2 failures)"
        );
    }

    #[test]
    fn report_serializes() {
        let report = JobReport {
            job_id: "j".into(),
            user: "u".into(),
            workload: "wc".into(),
            state: JobState::Failed,
            error: Some(ReportedError {
                kind: ErrorKind::OutputConflict,
                message: "output path /out already exists".into(),
            }),
            counters: CounterSnapshot::default(),
            tasks: vec![],
            failures: vec![],
            outputs: vec![],
            elapsed_ms: 3,
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"]["kind"], "output_conflict");
        assert!(report.to_string().contains("FAILED"));
    }
}
