//! The shuffle between the map and the reduce phase.
//!
//! Map attempts buffer their output in a [`MapOutputBuffer`], which sorts
//! by `(partition, key)` and spills to attempt-scoped files. The
//! coordinator commits one [`ShuffleOutput`] per map task. Once every map
//! task is committed, each reduce task merges its partition out of all of
//! them and reads it back as a [`GroupedStream`].

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use itertools::Itertools;
use tracing::{debug, info, warn};

use common::{KeyValue, MrError, Result};

pub mod buffer;
pub mod group;
pub mod merge;
pub mod segment;

pub use buffer::{MapOutputBuffer, MemoryRun, ShuffleOutput};
pub use group::{GroupedStream, Values};
pub use merge::MergeIter;
pub use segment::{PartitionRange, SpillSegment};

/// A sorted stream of one partition's records from one run.
pub type RecordSource = Box<dyn Iterator<Item = Result<KeyValue>> + Send>;

/// Per-job owner of the spill storage and of the committed map outputs.
#[derive(Debug)]
pub struct ShuffleEngine {
    root: PathBuf,
    map_count: usize,
    reduce_count: u32,
    spill_threshold: usize,
    io_retries: u32,
    committed: DashMap<usize, Arc<ShuffleOutput>>,
}

impl ShuffleEngine {
    /// Creates the job's spill root, `<spill_dir>/mrl-<job_id>`.
    pub fn new(
        job_id: &str,
        spill_dir: &Path,
        map_count: usize,
        reduce_count: u32,
        spill_threshold: usize,
        io_retries: u32,
    ) -> Result<Self> {
        let root = spill_dir.join(format!("mrl-{job_id}"));
        std::fs::create_dir_all(&root)
            .map_err(|e| MrError::shuffle_io(format!("creating {}", root.display()), e))?;
        debug!("spill root {}", root.display());

        Ok(Self {
            root,
            map_count,
            reduce_count,
            spill_threshold,
            io_retries,
            committed: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn reduce_count(&self) -> u32 {
        self.reduce_count
    }

    fn attempt_dir(&self, map_index: usize, attempt: u32) -> PathBuf {
        self.root.join(format!("map-{map_index:04}-{attempt}"))
    }

    /// A fresh buffer writing into the attempt's own spill directory.
    ///
    /// Committed outputs live until the job ends, so only a single map task
    /// may keep its output in memory. With more, every attempt ends on disk
    /// and memory use stays at one buffer per running attempt.
    pub fn attempt_buffer(&self, map_index: usize, attempt: u32) -> Result<MapOutputBuffer> {
        let dir = self.attempt_dir(map_index, attempt);
        remove_dir(&dir)?;
        std::fs::create_dir_all(&dir)
            .map_err(|e| MrError::shuffle_io(format!("creating {}", dir.display()), e))?;
        Ok(
            MapOutputBuffer::new(dir, self.reduce_count, self.spill_threshold)
                .keep_in_memory(self.map_count <= 1),
        )
    }

    /// Register the output of a map attempt. Only the first attempt to
    /// commit for a task is kept; `false` means this one was discarded.
    pub fn commit(&self, map_index: usize, attempt: u32, output: ShuffleOutput) -> bool {
        match self.committed.entry(map_index) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                drop(output);
                self.discard(map_index, attempt);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(
                    "committed map {map_index} attempt {attempt}: {} records, {} spills",
                    output.records,
                    output.spills()
                );
                slot.insert(Arc::new(output));
                true
            }
        }
    }

    /// Delete whatever a map attempt left behind.
    pub fn discard(&self, map_index: usize, attempt: u32) {
        let dir = self.attempt_dir(map_index, attempt);
        if let Err(e) = remove_dir(&dir) {
            warn!("could not remove {}: {e}", dir.display());
        }
    }

    /// Checks that every map task has a committed output whose spills are
    /// still on disk.
    pub fn verify_ready(&self) -> Result<()> {
        let missing = (0..self.map_count)
            .filter(|i| !self.committed.contains_key(i))
            .collect_vec();
        if !missing.is_empty() {
            return Err(MrError::Internal(format!(
                "map tasks without committed output: {}",
                missing.iter().join(", ")
            )));
        }

        for entry in self.committed.iter() {
            for segment in &entry.value().segments {
                if !segment.path.exists() {
                    return Err(MrError::shuffle_io(
                        format!("verifying map {}", entry.key()),
                        std::io::Error::new(
                            IoErrorKind::NotFound,
                            format!("{} is gone", segment.path.display()),
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Total records committed by the map phase.
    pub fn committed_records(&self) -> u64 {
        self.committed.iter().map(|e| e.value().records).sum()
    }

    pub fn committed_spills(&self) -> usize {
        self.committed.iter().map(|e| e.value().spills()).sum()
    }

    /// Merge `partition` out of every committed output, in map task order.
    pub fn partition_stream(&self, partition: u32) -> Result<GroupedStream<MergeIter>> {
        if partition >= self.reduce_count {
            return Err(MrError::Internal(format!(
                "partition {partition} out of range 0..{}",
                self.reduce_count
            )));
        }

        let mut sources = Vec::new();
        for map_index in 0..self.map_count {
            let output = self
                .committed
                .get(&map_index)
                .map(|e| e.value().clone())
                .ok_or_else(|| {
                    MrError::Internal(format!("map task {map_index} has no committed output"))
                })?;
            sources.extend(output.sources(partition, self.io_retries));
        }
        Ok(GroupedStream::new(MergeIter::new(sources)))
    }

    /// Remove the spill root. Called when the job ends, whatever the outcome.
    pub fn cleanup(&self) {
        match remove_dir(&self.root) {
            Ok(()) => info!("removed spill root {}", self.root.display()),
            Err(e) => warn!("could not remove spill root {}: {e}", self.root.display()),
        }
    }
}

impl Drop for ShuffleEngine {
    fn drop(&mut self) {
        let _ = remove_dir(&self.root);
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(MrError::shuffle_io(format!("removing {}", dir.display()), e)),
    }
}
