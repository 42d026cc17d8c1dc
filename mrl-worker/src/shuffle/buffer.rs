use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use bytesize::ByteSize;
use tracing::debug;

use common::{partition_for, KeyValue, Result};

use super::segment::{SegmentSource, SpillSegment};
use super::RecordSource;

/// Bookkeeping bytes charged per buffered record on top of its payload.
pub const RECORD_OVERHEAD: usize = 16;

/// Collects the pairs one map attempt emits, spilling sorted runs to disk
/// whenever the buffered size goes over the threshold.
#[derive(Debug)]
pub struct MapOutputBuffer {
    dir: PathBuf,
    reduce_count: u32,
    spill_threshold: usize,
    records: Vec<(u32, KeyValue)>,
    buffered: usize,
    segments: Vec<SpillSegment>,
    emitted: u64,
    keep_in_memory: bool,
}

impl MapOutputBuffer {
    pub fn new(dir: PathBuf, reduce_count: u32, spill_threshold: usize) -> Self {
        Self {
            dir,
            reduce_count,
            spill_threshold,
            records: Vec::new(),
            buffered: 0,
            segments: Vec::new(),
            emitted: 0,
            keep_in_memory: true,
        }
    }

    /// Whether a run that never went over the threshold may stay in memory
    /// after [`finish`](Self::finish). When not, it is spilled like any
    /// other run.
    pub fn keep_in_memory(mut self, keep: bool) -> Self {
        self.keep_in_memory = keep;
        self
    }

    pub fn push(&mut self, kv: KeyValue) -> Result<()> {
        let partition = partition_for(&kv.key, self.reduce_count);
        self.buffered += kv.payload_len() + RECORD_OVERHEAD;
        self.emitted += 1;
        self.records.push((partition, kv));

        if self.buffered > self.spill_threshold {
            self.spill()?;
        }
        Ok(())
    }

    fn sort(&mut self) {
        // Stable, so equal keys keep their emission order.
        self.records
            .sort_by(|(pa, a), (pb, b)| pa.cmp(pb).then_with(|| a.key.cmp(&b.key)));
    }

    fn spill(&mut self) -> Result<()> {
        self.sort();
        let path = self.dir.join(format!("spill-{}.seg", self.segments.len()));
        let segment = SpillSegment::write(&path, self.reduce_count, &self.records)?;
        debug!(
            "spilled {} records ({}) to {}",
            self.records.len(),
            ByteSize(segment.len()),
            path.display()
        );
        self.segments.push(segment);
        self.records.clear();
        self.buffered = 0;
        Ok(())
    }

    /// Sort what is left and seal the attempt's output. A run that never
    /// spilled stays in memory if the buffer allows it.
    pub fn finish(mut self) -> Result<ShuffleOutput> {
        let memory = if self.segments.is_empty() && self.keep_in_memory {
            self.sort();
            Some(MemoryRun::new(
                std::mem::take(&mut self.records),
                self.reduce_count,
            ))
        } else {
            if !self.records.is_empty() {
                self.spill()?;
            }
            None
        };

        Ok(ShuffleOutput {
            dir: self.dir,
            segments: self.segments,
            memory,
            records: self.emitted,
            input_records: 0,
        })
    }
}

/// A sorted run kept in memory, with the slice of each partition.
#[derive(Debug, Clone)]
pub struct MemoryRun {
    records: Arc<Vec<KeyValue>>,
    ranges: Vec<Range<usize>>,
}

impl MemoryRun {
    fn new(sorted: Vec<(u32, KeyValue)>, reduce_count: u32) -> Self {
        let mut ranges = vec![0..0; reduce_count as usize];
        let mut records = Vec::with_capacity(sorted.len());
        for (i, (partition, kv)) in sorted.into_iter().enumerate() {
            let range = &mut ranges[partition as usize];
            if range.is_empty() {
                *range = i..i;
            }
            range.end = i + 1;
            records.push(kv);
        }
        Self {
            records: Arc::new(records),
            ranges,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn partition(&self, partition: u32) -> MemorySource {
        let range = self.ranges.get(partition as usize).cloned().unwrap_or(0..0);
        MemorySource {
            records: self.records.clone(),
            range,
        }
    }
}

struct MemorySource {
    records: Arc<Vec<KeyValue>>,
    range: Range<usize>,
}

impl Iterator for MemorySource {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Result<KeyValue>> {
        let i = self.range.next()?;
        Some(Ok(self.records[i].clone()))
    }
}

/// Everything one successful map attempt produced for the shuffle.
#[derive(Debug, Clone)]
pub struct ShuffleOutput {
    /// The attempt's spill directory.
    pub dir: PathBuf,
    pub segments: Vec<SpillSegment>,
    pub memory: Option<MemoryRun>,

    /// Pairs emitted by the map function.
    pub records: u64,

    /// Input records the map function was called with.
    pub input_records: u64,
}

impl ShuffleOutput {
    /// The sources holding `partition`, in spill order.
    pub fn sources(&self, partition: u32, retries: u32) -> Vec<RecordSource> {
        let mut sources: Vec<RecordSource> = self
            .segments
            .iter()
            .map(|s| {
                Box::new(SegmentSource::new(s.path.clone(), s.range(partition), retries))
                    as RecordSource
            })
            .collect();
        if let Some(memory) = &self.memory {
            sources.push(Box::new(memory.partition(partition)));
        }
        sources
    }

    pub fn spills(&self) -> usize {
        self.segments.len()
    }
}
