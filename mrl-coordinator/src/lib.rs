//! Runs map-reduce jobs: splits the input, schedules map and reduce task
//! attempts with retries and timeouts, and promotes the output once every
//! task succeeded.

pub mod config;
pub mod core;
pub mod jobs;
pub mod report;
pub mod tasks;

mod phases;
mod scheduler;

pub use crate::config::{JobConfig, OutputPolicy};
pub use crate::core::{JobCoordinator, JobHandle};
pub use crate::jobs::{Job, JobState};
pub use crate::report::{CounterSnapshot, JobFailure, JobReport, ReportedError, TaskFailure};
pub use crate::tasks::{TaskId, TaskInfo, TaskKind, TaskState};
