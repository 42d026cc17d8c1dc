use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use common::storage::minio::ClientConfig;
use common::storage::{LocalStorage, S3Storage, Storage};
use mrl_coordinator::{JobConfig, JobCoordinator, JobReport, OutputPolicy};

use crate::args::{StorageArgs, SubmitArgs};

/// Build the job config: the `--config` file if any, then the flags.
pub fn job_config(args: &SubmitArgs) -> Result<JobConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading job config {}", path.display()))?;
            JobConfig::from_json(&json)?
        }
        None => JobConfig::default(),
    };

    if let Some(input) = &args.input {
        config.input = input.clone();
    }
    if let Some(output) = &args.output {
        config.output = output.clone();
    }
    if let Some(workload) = &args.workload {
        config.workload = workload.clone();
    }
    if !args.args.is_empty() {
        config.aux = args.args.clone();
    }
    if let Some(reducers) = args.reducers {
        config.reduce_count = reducers;
    }
    if let Some(split_size) = args.split_size {
        config.split_size = split_size;
    }
    if let Some(spill_threshold) = args.spill_threshold {
        config.spill_threshold = spill_threshold;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(parallelism) = args.parallelism {
        config.parallelism = parallelism;
    }
    if let Some(secs) = args.task_timeout {
        config.task_timeout = Duration::from_secs(secs);
    }
    if args.overwrite {
        config.output_policy = OutputPolicy::Overwrite;
    }
    if let Some(spill_dir) = &args.spill_dir {
        config.spill_dir = spill_dir.clone();
    }

    if args.storage.s3_url.is_none() {
        config.input = absolute(&config.input)?;
        config.output = absolute(&config.output)?;
    }

    config.validate()?;
    config.resolve_workload()?;
    Ok(config)
}

/// Local paths are resolved against the working directory.
fn absolute(path: &str) -> Result<String> {
    if path.is_empty() || Path::new(path).is_absolute() {
        return Ok(path.to_string());
    }
    let cwd = std::env::current_dir().context("resolving relative path")?;
    Ok(cwd.join(path).to_string_lossy().into_owned())
}

pub fn storage(args: &StorageArgs) -> Arc<dyn Storage> {
    match &args.s3_url {
        Some(url) => {
            info!("using object storage at {url}");
            Arc::new(S3Storage::from_conf(ClientConfig {
                access_key_id: args.access_key_id.clone(),
                secret_access_key: args.secret_access_key.clone(),
                region: args.region.clone(),
                url: url.clone(),
            }))
        }
        None => Arc::new(LocalStorage::new("/")),
    }
}

/// Run the job until it finishes. Ctrl-C cancels it.
pub async fn submit(config: JobConfig, storage: Arc<dyn Storage>) -> JobReport {
    let coordinator = JobCoordinator::new(storage, config);
    let handle = coordinator.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling job");
            handle.cancel();
        }
    });

    coordinator.run().await
}

pub fn write_report(report: &JobReport, path: &Path) -> Result<()> {
    let json = report.to_json().context("serializing job report")?;
    std::fs::write(path, json).with_context(|| format!("writing report {}", path.display()))
}

#[cfg(test)]
mod tests {
    use bytesize::ByteSize;

    use super::*;

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("job.json");
        std::fs::write(
            &file,
            r#"{"input": "/data/in", "output": "/data/out", "workload": "wc", "reduce_count": 4, "max_attempts": 2}"#,
        )
        .unwrap();

        let args = SubmitArgs {
            config: Some(file),
            reducers: Some(2),
            split_size: Some(ByteSize::kib(4)),
            overwrite: true,
            ..Default::default()
        };
        let config = job_config(&args).unwrap();

        assert_eq!(config.input, "/data/in");
        assert_eq!(config.reduce_count, 2);
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.split_size, ByteSize::kib(4));
        assert_eq!(config.output_policy, OutputPolicy::Overwrite);
    }

    #[test]
    fn relative_local_paths_become_absolute() {
        let args = SubmitArgs {
            input: Some("in".into()),
            output: Some("/out".into()),
            workload: Some("wc".into()),
            ..Default::default()
        };
        let config = job_config(&args).unwrap();
        assert!(Path::new(&config.input).is_absolute());
        assert_eq!(config.output, "/out");
    }

    #[test]
    fn missing_settings_are_config_errors() {
        let args = SubmitArgs {
            input: Some("/in".into()),
            output: Some("/out".into()),
            workload: Some("nope".into()),
            ..Default::default()
        };
        assert!(job_config(&args).is_err());
        assert!(job_config(&SubmitArgs::default()).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submit_runs_a_local_job() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("in")).unwrap();
        std::fs::write(dir.path().join("in/a.txt"), "b a\na\n").unwrap();

        let args = SubmitArgs {
            input: Some(dir.path().join("in").to_string_lossy().into_owned()),
            output: Some(dir.path().join("out").to_string_lossy().into_owned()),
            workload: Some("wc".into()),
            spill_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let config = job_config(&args).unwrap();
        let report = submit(config, storage(&args.storage)).await;

        assert!(report.is_success(), "{report}");
        let out = std::fs::read_to_string(dir.path().join("out/mr-out-0")).unwrap();
        assert_eq!(out, "a\t2\nb\t1\n");

        let report_path = dir.path().join("report.json");
        write_report(&report, &report_path).unwrap();
        assert!(std::fs::read_to_string(report_path)
            .unwrap()
            .contains("\"completed\""));
    }
}
