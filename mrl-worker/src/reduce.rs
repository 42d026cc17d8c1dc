//! The reduce task: feed each group of a partition through the reduce
//! function and write what it returns.

use anyhow::Context;
use bytes::Bytes;
use tracing::debug;

use common::{KeyValue, MrError, Result, Workload};

use crate::output::OutputWriter;
use crate::shuffle::GroupedStream;
use crate::task::TaskContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceStats {
    pub groups: u64,
    pub records_in: u64,
    pub records_out: u64,
}

/// Runs `workload`'s reduce function over every group of `partition`.
///
/// Groups are visited in key order on the calling thread. Blocking.
pub fn run_reduce<I>(
    partition: u32,
    groups: &mut GroupedStream<I>,
    workload: &Workload,
    aux: Bytes,
    writer: &mut OutputWriter,
    ctx: &TaskContext,
) -> Result<ReduceStats>
where
    I: Iterator<Item = Result<KeyValue>>,
{
    let reduce_err = |source: anyhow::Error| MrError::ReduceExecution { partition, source };
    let mut stats = ReduceStats::default();
    groups.set_heartbeat(ctx.clone());

    loop {
        let (key, values) = match groups.next_group() {
            Some(group) => group,
            None => break,
        };
        ctx.tick()?;

        let emitted = (workload.reduce_fn)(key.clone(), Box::new(values), aux.clone())
            .with_context(|| format!("reducing key {:?}", String::from_utf8_lossy(&key)))
            .map_err(reduce_err)?;

        if let Some(e) = groups.take_error() {
            return Err(e);
        }
        stats.groups += 1;

        for kv in emitted {
            writer.write(&kv.map_err(reduce_err)?)?;
            stats.records_out += 1;
        }
    }

    if let Some(e) = groups.take_error() {
        return Err(e);
    }
    stats.records_in = groups.records_read();
    debug!(
        "partition {partition}: {} groups, {} records in, {} out",
        stats.groups, stats.records_in, stats.records_out
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use common::storage::LocalStorage;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::shuffle::RecordSource;

    fn stream(pairs: &[(&'static str, &'static str)]) -> GroupedStream<std::vec::IntoIter<Result<KeyValue>>> {
        let records: Vec<Result<KeyValue>> = pairs
            .iter()
            .map(|(k, v)| Ok(KeyValue::new(*k, *v)))
            .collect();
        GroupedStream::new(records.into_iter())
    }

    fn reduce_to_string(
        groups: &mut GroupedStream<impl Iterator<Item = Result<KeyValue>>>,
        name: &str,
    ) -> (Result<ReduceStats>, String) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut writer = rt
            .block_on(OutputWriter::create(&storage, "/out/part"))
            .unwrap();
        let ctx = TaskContext::new(CancellationToken::new());
        let workload = workload::try_named(name).unwrap();

        let result = run_reduce(0, groups, &workload, Bytes::new(), &mut writer, &ctx);
        writer.close().unwrap();
        let written = std::fs::read_to_string(dir.path().join("out/part")).unwrap();
        (result, written)
    }

    #[test]
    fn word_count_sums_each_group() {
        let mut groups = stream(&[("fox", "1"), ("fox", "1"), ("the", "1"), ("the", "2")]);
        let (stats, written) = reduce_to_string(&mut groups, "wc");

        assert_eq!(written, "fox\t2\nthe\t3\n");
        assert_eq!(
            stats.unwrap(),
            ReduceStats {
                groups: 2,
                records_in: 4,
                records_out: 2
            }
        );
    }

    #[test]
    fn reduce_errors_carry_the_partition() {
        let mut groups = stream(&[("fox", "one")]);
        let (stats, _) = reduce_to_string(&mut groups, "wc");
        let err = stats.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::ReduceExecution);
    }

    #[test]
    fn merge_errors_fail_the_task() {
        let broken: RecordSource = Box::new(
            vec![
                Ok(KeyValue::new("a", "1")),
                Err(MrError::Internal("segment lost".into())),
            ]
            .into_iter(),
        );
        let mut groups = GroupedStream::new(broken);
        let (stats, _) = reduce_to_string(&mut groups, "wc");
        assert_eq!(stats.unwrap_err().kind(), common::ErrorKind::Internal);
    }
}
