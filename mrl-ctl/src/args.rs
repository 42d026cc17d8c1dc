use std::path::PathBuf;

use bytesize::ByteSize;
use clap::{command, Args as ClapArgs, Parser, Subcommand};

//
// For parsing user specified command.
//
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the built-in workloads.
    Workloads,
    /// Run a job and wait for it to finish.
    Submit(SubmitArgs),
}

/// Every job setting is optional here so that `--config` can supply it.
/// Flags win over the file.
#[derive(ClapArgs, Debug, Default)]
pub struct SubmitArgs {
    /// Input file, directory, or directory followed by a file name glob.
    #[arg(short, long)]
    pub input: Option<String>,

    /// Output directory. Must not exist unless `--overwrite` is given.
    #[arg(short, long)]
    pub output: Option<String>,

    /// Name of the workload.
    #[arg(short, long)]
    pub workload: Option<String>,

    /// Number of reduce partitions.
    #[arg(short, long)]
    pub reducers: Option<u32>,

    /// Target split size, e.g. `64MiB`.
    #[arg(long)]
    pub split_size: Option<ByteSize>,

    /// Buffered map output before spilling, e.g. `16MiB`.
    #[arg(long)]
    pub spill_threshold: Option<ByteSize>,

    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Task attempts running at once. Defaults to the number of CPUs.
    #[arg(short, long)]
    pub parallelism: Option<usize>,

    /// Seconds an attempt may stay silent before it is abandoned.
    #[arg(long)]
    pub task_timeout: Option<u64>,

    /// Replace an existing output directory.
    #[arg(long)]
    pub overwrite: bool,

    /// Directory map attempts spill to.
    #[arg(long)]
    pub spill_dir: Option<PathBuf>,

    /// JSON job config to start from.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Write the job report here as JSON.
    #[arg(long)]
    pub report: Option<PathBuf>,

    #[command(flatten)]
    pub storage: StorageArgs,

    /// Auxiliary arguments to pass to the MapReduce application.
    #[clap(value_parser, last = true)]
    pub args: Vec<String>,
}

/// Local storage is used unless an S3 endpoint is given.
#[derive(ClapArgs, Debug, Default)]
pub struct StorageArgs {
    /// S3 / minio endpoint, e.g. `http://127.0.0.1:9000`.
    #[arg(long)]
    pub s3_url: Option<String>,

    /// Minio access key / user ID.
    #[arg(long, default_value = "robert")]
    pub access_key_id: String,

    /// Minio secret key / password.
    #[arg(long, default_value = "robertisawesome")]
    pub secret_access_key: String,

    /// Minio region.
    #[arg(long, default_value = "us-east-1")]
    pub region: String,
}

/// Parse the user command.
pub fn parse_args() -> Commands {
    Args::parse().command
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(argv: &[&str]) -> SubmitArgs {
        let mut full = vec!["mrl-ctl", "submit"];
        full.extend_from_slice(argv);
        match Args::try_parse_from(full).unwrap().command {
            Commands::Submit(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn submit_flags() {
        let args = submit(&[
            "--input",
            "/in",
            "--output",
            "/out",
            "--workload",
            "grep",
            "--reducers",
            "3",
            "--split-size",
            "1MiB",
            "--task-timeout",
            "5",
            "--overwrite",
            "--",
            "ERROR",
        ]);
        assert_eq!(args.input.as_deref(), Some("/in"));
        assert_eq!(args.workload.as_deref(), Some("grep"));
        assert_eq!(args.reducers, Some(3));
        assert_eq!(args.split_size, Some(ByteSize::mib(1)));
        assert_eq!(args.task_timeout, Some(5));
        assert!(args.overwrite);
        assert_eq!(args.args, vec!["ERROR".to_string()]);
        assert!(args.storage.s3_url.is_none());
    }

    #[test]
    fn everything_is_optional() {
        let args = submit(&["--config", "job.json"]);
        assert!(args.input.is_none());
        assert!(!args.overwrite);
        assert_eq!(args.config, Some(PathBuf::from("job.json")));
        assert_eq!(args.storage.region, "us-east-1");
    }

    #[test]
    fn bad_sizes_are_rejected() {
        assert!(Args::try_parse_from(["mrl-ctl", "submit", "--split-size", "lots"]).is_err());
    }
}
