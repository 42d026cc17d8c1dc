//! The map and reduce phases, plugged into the scheduler.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::warn;

use common::storage::Storage;
use common::{MrError, Result, Workload};
use mrl_worker::map::execute_map;
use mrl_worker::output::{attempt_dir, attempt_path};
use mrl_worker::shuffle::ShuffleOutput;
use mrl_worker::{read_split, run_reduce, OutputWriter, ReduceStats, ShuffleEngine, Split, TaskContext};

use crate::report::Counters;
use crate::scheduler::PhaseTask;
use crate::tasks::TaskKind;

pub(crate) struct MapPhase {
    pub storage: Arc<dyn Storage>,
    pub splits: Vec<Split>,
    pub shuffle: Arc<ShuffleEngine>,
    pub workload: Workload,
    pub aux: Bytes,
    pub counters: Arc<Counters>,
}

#[async_trait]
impl PhaseTask for MapPhase {
    type Output = ShuffleOutput;

    const KIND: TaskKind = TaskKind::Map;

    async fn launch(
        self: Arc<Self>,
        index: usize,
        attempt: u32,
        ctx: TaskContext,
    ) -> Result<ShuffleOutput> {
        let split = self
            .splits
            .get(index)
            .cloned()
            .ok_or_else(|| MrError::Internal(format!("no split {index}")))?;

        let contents = read_split(self.storage.as_ref(), &split).await?;
        ctx.tick()?;
        let buffer = self.shuffle.attempt_buffer(index, attempt)?;
        let workload = self.workload;
        let aux = self.aux.clone();

        tokio::task::spawn_blocking(move || execute_map(&contents, &workload, aux, buffer, ctx))
            .await
            .map_err(|e| MrError::MapExecution {
                split: split.to_string(),
                source: anyhow!("map attempt panicked: {e}"),
            })?
    }

    async fn accept(&self, index: usize, attempt: u32, output: ShuffleOutput) -> Result<()> {
        Counters::add(&self.counters.map_input_records, output.input_records);
        Counters::add(&self.counters.map_output_records, output.records);
        Counters::add(&self.counters.spills, output.spills() as u64);
        if !self.shuffle.commit(index, attempt, output) {
            return Err(MrError::Internal(format!(
                "map task {index} was committed twice"
            )));
        }
        Ok(())
    }

    async fn discard(&self, index: usize, attempt: u32) {
        self.shuffle.discard(index, attempt);
    }
}

pub(crate) struct ReduceResult {
    stats: ReduceStats,
    bytes: u64,
}

pub(crate) struct ReducePhase {
    pub storage: Arc<dyn Storage>,
    pub output: String,
    pub shuffle: Arc<ShuffleEngine>,
    pub workload: Workload,
    pub aux: Bytes,
    pub counters: Arc<Counters>,

    /// Partition to its accepted attempt.
    pub accepted: DashMap<usize, u32>,
}

impl ReducePhase {
    pub fn accepted_attempt(&self, partition: usize) -> Option<u32> {
        self.accepted.get(&partition).map(|a| *a)
    }
}

#[async_trait]
impl PhaseTask for ReducePhase {
    type Output = ReduceResult;

    const KIND: TaskKind = TaskKind::Reduce;

    async fn launch(
        self: Arc<Self>,
        index: usize,
        attempt: u32,
        ctx: TaskContext,
    ) -> Result<ReduceResult> {
        let partition = index as u32;
        let path = attempt_path(&self.output, partition, attempt);
        let mut writer = OutputWriter::create(self.storage.as_ref(), &path).await?;
        let mut groups = self.shuffle.partition_stream(partition)?;
        let workload = self.workload;
        let aux = self.aux.clone();

        tokio::task::spawn_blocking(move || -> Result<ReduceResult> {
            let stats = run_reduce(partition, &mut groups, &workload, aux, &mut writer, &ctx)?;
            let bytes = writer.bytes_written();
            writer.close()?;
            Ok(ReduceResult { stats, bytes })
        })
        .await
        .map_err(|e| MrError::ReduceExecution {
            partition,
            source: anyhow!("reduce attempt panicked: {e}"),
        })?
    }

    async fn accept(&self, index: usize, attempt: u32, output: ReduceResult) -> Result<()> {
        Counters::add(&self.counters.reduce_groups, output.stats.groups);
        Counters::add(&self.counters.reduce_input_records, output.stats.records_in);
        Counters::add(&self.counters.reduce_output_records, output.stats.records_out);
        Counters::add(&self.counters.output_bytes, output.bytes);
        self.accepted.insert(index, attempt);
        Ok(())
    }

    async fn discard(&self, index: usize, attempt: u32) {
        let dir = attempt_dir(&self.output, index as u32, attempt);
        if let Err(e) = self.storage.delete(&dir, true).await {
            warn!("could not remove {dir}: {e}");
        }
    }
}
