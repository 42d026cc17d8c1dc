use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::info;

use common::{MrError, Result};

/// State of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job not started.
    Pending,

    /// Listing and splitting the input.
    Splitting,

    /// Mapping phase.
    Mapping,

    /// Every map task committed; verifying the shuffle inputs.
    ShuffleBarrier,

    /// Reducing phase.
    Reducing,

    /// Job completed, output promoted.
    Completed,

    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        match (self, next) {
            (Pending, Splitting)
            | (Splitting, Mapping)
            | (Mapping, ShuffleBarrier)
            | (ShuffleBarrier, Reducing)
            | (Reducing, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Splitting => "SPLITTING",
            JobState::Mapping => "MAPPING",
            JobState::ShuffleBarrier => "SHUFFLE_BARRIER",
            JobState::Reducing => "REDUCING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A job context.
#[derive(Debug, Clone)]
pub struct Job {
    id: String,
    state: JobState,
}

impl Job {
    pub fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            id: format!("{millis:x}-{:08x}", rand::random::<u32>()),
            state: JobState::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the state of the job.
    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MrError::Internal(format!(
                "job {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        info!("job {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_linear() {
        let mut job = Job::new();
        for next in [
            JobState::Splitting,
            JobState::Mapping,
            JobState::ShuffleBarrier,
            JobState::Reducing,
            JobState::Completed,
        ] {
            job.transition(next).unwrap();
        }
        assert_eq!(job.state(), JobState::Completed);
        assert!(job.transition(JobState::Failed).is_err());
    }

    #[test]
    fn phases_cannot_be_skipped() {
        let mut job = Job::new();
        assert!(job.transition(JobState::Reducing).is_err());
        assert_eq!(job.state(), JobState::Pending);
        job.transition(JobState::Failed).unwrap();
        assert!(job.transition(JobState::Splitting).is_err());
    }

    #[test]
    fn ids_differ() {
        assert_ne!(Job::new().id(), Job::new().id());
    }
}
