//! The task table: one entry per map and reduce task, shared by the
//! scheduler and the attempts it supervises.

use std::fmt;

use dashmap::DashMap;
use serde::{Serialize, Serializer};

use common::{MrError, Result};

use crate::report::TaskFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Map,
    Reduce,
}

/// Identifies a task. Map tasks are numbered by split, reduce tasks by
/// partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub kind: TaskKind,
    pub index: usize,
}

impl TaskId {
    pub fn new(kind: TaskKind, index: usize) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TaskKind::Map => "map",
            TaskKind::Reduce => "reduce",
        };
        write!(f, "{kind}-{:04}", self.index)
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running { attempt: u32 },
    Succeeded { attempt: u32 },
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub state: TaskState,

    /// Attempts started so far.
    pub attempts: u32,
    pub failures: Vec<TaskFailure>,
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Attempts left; schedule another one.
    Again,

    /// The task has failed for good.
    Exhausted,

    /// The attempt was no longer the task's current one.
    Stale,
}

#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: DashMap<TaskId, TaskInfo>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` pending tasks of `kind`, numbered from 0.
    pub fn insert_pending(&self, kind: TaskKind, count: usize) {
        for index in 0..count {
            let id = TaskId::new(kind, index);
            self.tasks.insert(
                id,
                TaskInfo {
                    id,
                    state: TaskState::Pending,
                    attempts: 0,
                    failures: Vec::new(),
                },
            );
        }
    }

    fn missing(id: TaskId) -> MrError {
        MrError::Internal(format!("unknown task {id}"))
    }

    /// Start the next attempt of a pending task and return its number.
    pub fn start_attempt(&self, id: TaskId) -> Result<u32> {
        let mut task = self.tasks.get_mut(&id).ok_or_else(|| Self::missing(id))?;
        if task.state != TaskState::Pending {
            return Err(MrError::Internal(format!(
                "{id} is {:?}, not pending",
                task.state
            )));
        }
        task.attempts += 1;
        task.state = TaskState::Running {
            attempt: task.attempts,
        };
        Ok(task.attempts)
    }

    /// Mark `attempt` as the task's successful one. Returns `false` when the
    /// attempt is not the one currently running.
    pub fn succeed(&self, id: TaskId, attempt: u32) -> bool {
        match self.tasks.get_mut(&id) {
            Some(mut task) if task.state == (TaskState::Running { attempt }) => {
                task.state = TaskState::Succeeded { attempt };
                true
            }
            _ => false,
        }
    }

    /// Record a failed attempt; the task goes back to pending while it has
    /// attempts left.
    pub fn fail(&self, id: TaskId, attempt: u32, error: &MrError, max_attempts: u32) -> Retry {
        let Some(mut task) = self.tasks.get_mut(&id) else {
            return Retry::Stale;
        };
        if task.state != (TaskState::Running { attempt }) {
            return Retry::Stale;
        }

        task.failures.push(TaskFailure::new(id, attempt, error));
        if task.attempts >= max_attempts {
            task.state = TaskState::Failed;
            Retry::Exhausted
        } else {
            task.state = TaskState::Pending;
            Retry::Again
        }
    }

    pub fn get(&self, id: TaskId) -> Option<TaskInfo> {
        self.tasks.get(&id).map(|t| t.value().clone())
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|t| t.state)
    }

    pub fn all_succeeded(&self, kind: TaskKind) -> bool {
        self.tasks
            .iter()
            .filter(|t| t.id.kind == kind)
            .all(|t| matches!(t.state, TaskState::Succeeded { .. }))
    }

    /// All tasks, ordered by id.
    pub fn snapshot(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<_> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Every recorded failure, ordered by task and attempt.
    pub fn failures(&self) -> Vec<TaskFailure> {
        self.snapshot()
            .into_iter()
            .flat_map(|t| t.failures)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_run_until_max_attempts() {
        let table = TaskTable::new();
        table.insert_pending(TaskKind::Map, 1);
        let id = TaskId::new(TaskKind::Map, 0);
        let err = MrError::Internal("boom".into());

        assert_eq!(table.start_attempt(id).unwrap(), 1);
        assert!(table.start_attempt(id).is_err());
        assert_eq!(table.fail(id, 1, &err, 2), Retry::Again);
        assert_eq!(table.start_attempt(id).unwrap(), 2);
        assert_eq!(table.fail(id, 2, &err, 2), Retry::Exhausted);
        assert_eq!(table.state(id), Some(TaskState::Failed));
        assert_eq!(table.failures().len(), 2);
    }

    #[test]
    fn only_the_current_attempt_counts() {
        let table = TaskTable::new();
        table.insert_pending(TaskKind::Reduce, 2);
        let id = TaskId::new(TaskKind::Reduce, 1);

        let first = table.start_attempt(id).unwrap();
        table.fail(id, first, &MrError::Cancelled, 4);
        let second = table.start_attempt(id).unwrap();

        assert!(!table.succeed(id, first));
        assert_eq!(table.fail(id, first, &MrError::Cancelled, 4), Retry::Stale);
        assert!(table.succeed(id, second));
        assert_eq!(table.state(id), Some(TaskState::Succeeded { attempt: 2 }));
        assert!(!table.all_succeeded(TaskKind::Reduce));
    }

    #[test]
    fn ids_render_padded() {
        assert_eq!(TaskId::new(TaskKind::Map, 3).to_string(), "map-0003");
        assert_eq!(
            serde_json::to_string(&TaskId::new(TaskKind::Reduce, 12)).unwrap(),
            "\"reduce-0012\""
        );
    }
}
