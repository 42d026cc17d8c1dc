//! Job configuration.

use std::path::PathBuf;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use common::{MrError, Result, Workload};

/// What to do when the output path already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Refuse to run the job.
    #[default]
    Fail,

    /// Delete the existing output before the job starts.
    Overwrite,
}

/// Everything a job needs to know. Every field but `input`, `output` and
/// `workload` has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// A file, a directory, or a directory followed by a file name glob.
    pub input: String,

    /// The output directory.
    pub output: String,

    /// Name of a built-in workload, see [`workload::NAMES`].
    pub workload: String,

    /// Auxiliary arguments, passed to the map and reduce functions joined
    /// by spaces.
    pub aux: Vec<String>,

    /// Number of reduce partitions, and of output files.
    pub reduce_count: u32,

    pub split_size: ByteSize,

    /// Buffered map output above which a map attempt spills to disk.
    pub spill_threshold: ByteSize,

    /// Attempts per task before the job fails.
    pub max_attempts: u32,

    /// Task attempts running at once.
    pub parallelism: usize,

    /// Silence after which a running attempt is abandoned.
    #[serde(with = "millis")]
    pub task_timeout: Duration,

    /// Base delay before a failed task is retried, jittered by ±50%.
    #[serde(with = "millis")]
    pub retry_backoff: Duration,

    pub output_policy: OutputPolicy,

    /// Where map attempts spill.
    pub spill_dir: PathBuf,

    /// Times a failed spill segment read is retried within a reduce attempt.
    pub shuffle_io_retries: u32,

    /// Recorded in the job report.
    pub user: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            output: String::new(),
            workload: String::new(),
            aux: Vec::new(),
            reduce_count: 1,
            split_size: ByteSize::mib(64),
            spill_threshold: ByteSize::mib(16),
            max_attempts: 4,
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            task_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(100),
            output_policy: OutputPolicy::Fail,
            spill_dir: std::env::temp_dir(),
            shuffle_io_retries: 3,
            user: std::env::var("USER").unwrap_or_default(),
        }
    }
}

impl JobConfig {
    pub fn new(
        input: impl Into<String>,
        output: impl Into<String>,
        workload: impl Into<String>,
    ) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            workload: workload.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MrError::Config(format!("bad job config: {e}")))
    }

    pub fn with_aux(mut self, aux: Vec<String>) -> Self {
        self.aux = aux;
        self
    }

    pub fn with_reduce_count(mut self, reduce_count: u32) -> Self {
        self.reduce_count = reduce_count;
        self
    }

    pub fn with_split_size(mut self, split_size: ByteSize) -> Self {
        self.split_size = split_size;
        self
    }

    pub fn with_spill_threshold(mut self, spill_threshold: ByteSize) -> Self {
        self.spill_threshold = spill_threshold;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_output_policy(mut self, output_policy: OutputPolicy) -> Self {
        self.output_policy = output_policy;
        self
    }

    pub fn with_spill_dir(mut self, spill_dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = spill_dir.into();
        self
    }

    /// Checks the settings that do not need storage.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(MrError::Config(msg.to_string()));

        if self.input.is_empty() {
            return fail("no input path");
        }
        if self.output.is_empty() {
            return fail("no output path");
        }
        if self.reduce_count == 0 {
            return fail("reduce_count must be at least 1");
        }
        if self.split_size.as_u64() == 0 {
            return fail("split_size must be positive");
        }
        if self.spill_threshold.as_u64() == 0 {
            return fail("spill_threshold must be positive");
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1");
        }
        if self.parallelism == 0 {
            return fail("parallelism must be at least 1");
        }
        if self.task_timeout.is_zero() {
            return fail("task_timeout must be positive");
        }
        Ok(())
    }

    /// The built-in workload named by `workload`.
    pub fn resolve_workload(&self) -> Result<Workload> {
        workload::try_named(&self.workload).ok_or_else(|| {
            MrError::Config(format!(
                "unknown workload `{}`, expected one of {}",
                self.workload,
                workload::NAMES.join(", ")
            ))
        })
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = JobConfig::new("/in", "/out", "wc");
        assert_eq!(config.reduce_count, 1);
        assert_eq!(config.split_size, ByteSize::mib(64));
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.output_policy, OutputPolicy::Fail);
        config.validate().unwrap();
    }

    #[test]
    fn json_fills_in_defaults() {
        let config = JobConfig::from_json(
            r#"{"input": "/in", "output": "/out", "workload": "grep",
                "aux": ["fox"], "reduce_count": 3, "split_size": 1024,
                "task_timeout": 2500, "output_policy": "overwrite"}"#,
        )
        .unwrap();
        assert_eq!(config.reduce_count, 3);
        assert_eq!(config.split_size, ByteSize::kib(1));
        assert_eq!(config.task_timeout, Duration::from_millis(2500));
        assert_eq!(config.output_policy, OutputPolicy::Overwrite);
        assert_eq!(config.spill_threshold, ByteSize::mib(16));
        assert!(config.resolve_workload().is_ok());
    }

    #[test]
    fn bad_settings_are_config_errors() {
        let zero = JobConfig::new("/in", "/out", "wc").with_reduce_count(0);
        assert_eq!(zero.validate().unwrap_err().kind(), common::ErrorKind::Config);

        let unknown = JobConfig::new("/in", "/out", "pagerank");
        assert_eq!(
            unknown.resolve_workload().unwrap_err().kind(),
            common::ErrorKind::Config
        );
        assert!(JobConfig::from_json("{").is_err());
    }
}
