//! Error taxonomy shared by the splitter, the tasks, the shuffle and the
//! coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = MrError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MrError {
    /// Storage could not open, create, list or measure a path.
    #[error("resource unavailable: {path}")]
    ResourceUnavailable {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// The map function failed, or a pair it emitted could not be buffered.
    #[error("map execution failed on split {split}")]
    MapExecution {
        split: String,
        #[source]
        source: anyhow::Error,
    },

    /// Spill write or merge read failure.
    #[error("shuffle I/O failed: {detail}")]
    ShuffleIo {
        detail: String,
        #[source]
        source: std::io::Error,
    },

    #[error("reduce execution failed on partition {partition}")]
    ReduceExecution {
        partition: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("output path {path} already exists")]
    OutputConflict { path: String },

    #[error("task {task} attempt {attempt} sent no heartbeat for {after:?}")]
    TaskTimeout {
        task: String,
        attempt: u32,
        after: Duration,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// The category of an [`MrError`], as it appears in job reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ResourceUnavailable,
    MapExecution,
    ShuffleIo,
    ReduceExecution,
    OutputConflict,
    TaskTimeout,
    Cancelled,
    Config,
    Internal,
}

impl MrError {
    pub fn unavailable(path: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        MrError::ResourceUnavailable {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn shuffle_io(detail: impl Into<String>, source: std::io::Error) -> Self {
        MrError::ShuffleIo {
            detail: detail.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MrError::ResourceUnavailable { .. } => ErrorKind::ResourceUnavailable,
            MrError::MapExecution { .. } => ErrorKind::MapExecution,
            MrError::ShuffleIo { .. } => ErrorKind::ShuffleIo,
            MrError::ReduceExecution { .. } => ErrorKind::ReduceExecution,
            MrError::OutputConflict { .. } => ErrorKind::OutputConflict,
            MrError::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            MrError::Cancelled => ErrorKind::Cancelled,
            MrError::Config(_) => ErrorKind::Config,
            MrError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error aborts the job without any retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MrError::OutputConflict { .. }
                | MrError::Cancelled
                | MrError::Config(_)
                | MrError::Internal(_)
        )
    }
}

/// Render an error together with its chain of causes on one line.
pub fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = e.to_string();
    let mut current = e.source();
    while let Some(cause) = current {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        current = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_includes_every_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = MrError::unavailable("/in/a.txt", io);
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert_eq!(
            error_chain(&err),
            "resource unavailable: /in/a.txt: no such file"
        );
    }

    #[test]
    fn fatal_errors_are_the_pre_flight_ones() {
        assert!(MrError::OutputConflict { path: "/out".into() }.is_fatal());
        assert!(MrError::Config("bad".into()).is_fatal());
        assert!(!MrError::TaskTimeout {
            task: "map-0000".into(),
            attempt: 1,
            after: Duration::from_secs(1),
        }
        .is_fatal());
    }
}
