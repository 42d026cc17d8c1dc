//! The map task: read a split, feed its lines through the map function and
//! the emitted pairs into the attempt's shuffle buffer.

use std::io::SeekFrom;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, instrument};

use common::storage::Storage;
use common::{KeyValue, KeyValues, MapFn, MrError, Result, Workload};

use crate::shuffle::{MapOutputBuffer, ShuffleOutput};
use crate::split::Split;
use crate::task::TaskContext;

/// The lines a split owns, read into memory.
#[derive(Debug, Clone)]
pub struct SplitContents {
    pub resource: String,

    /// Offset of `data[0]` within the resource.
    pub base_offset: u64,

    pub data: Bytes,
}

impl SplitContents {
    pub fn records(&self) -> LineRecords {
        LineRecords {
            data: self.data.clone(),
            base_offset: self.base_offset,
            pos: 0,
        }
    }
}

/// Reads the lines owned by `split`.
///
/// A line belongs to the split holding its first byte. A split that starts
/// mid-line skips to the next line start, and the last line starting inside
/// the split is read to its end even past the split boundary.
#[instrument(skip_all, fields(split = %split))]
pub async fn read_split(storage: &dyn Storage, split: &Split) -> Result<SplitContents> {
    if split.is_empty() {
        return Ok(SplitContents {
            resource: split.resource.clone(),
            base_offset: split.offset,
            data: Bytes::new(),
        });
    }

    let unavailable = |e: std::io::Error| MrError::unavailable(&split.resource, e);

    let mut reader = storage.open(&split.resource).await?;
    let mut start = split.offset;
    if start > 0 {
        // Looking at the byte before the range tells whether the range
        // begins on a line start.
        reader
            .seek(SeekFrom::Start(start - 1))
            .await
            .map_err(unavailable)?;
    }
    let mut reader = BufReader::new(reader);

    if start > 0 {
        let mut skipped = Vec::new();
        let n = reader
            .read_until(b'\n', &mut skipped)
            .await
            .map_err(unavailable)?;
        start = start - 1 + n as u64;
    }

    let end = split.end();
    let mut pos = start;
    let mut data = Vec::with_capacity(split.length as usize);
    while pos < end {
        let n = reader.read_until(b'\n', &mut data).await.map_err(unavailable)?;
        if n == 0 {
            break;
        }
        pos += n as u64;
    }

    debug!("read {} bytes starting at {start}", data.len());
    Ok(SplitContents {
        resource: split.resource.clone(),
        base_offset: start,
        data: Bytes::from(data),
    })
}

/// Iterates the lines of a [`SplitContents`].
///
/// The key of each record is the decimal offset of the line in the
/// resource, the value is the line without `\n` or `\r\n`.
#[derive(Debug, Clone)]
pub struct LineRecords {
    data: Bytes,
    base_offset: u64,
    pos: usize,
}

impl Iterator for LineRecords {
    type Item = KeyValue;

    fn next(&mut self) -> Option<KeyValue> {
        if self.pos >= self.data.len() {
            return None;
        }

        let rest = &self.data[self.pos..];
        let (line_len, next) = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => (i, self.pos + i + 1),
            None => (rest.len(), self.data.len()),
        };
        let mut line = self.data.slice(self.pos..self.pos + line_len);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        let key = (self.base_offset + self.pos as u64).to_string();
        self.pos = next;
        Some(KeyValue::new(key, line))
    }
}

/// The lazy output of the map function over every record of a split.
pub struct MapRun {
    split: String,
    records: LineRecords,
    map_fn: MapFn,
    aux: Bytes,
    ctx: TaskContext,
    current: Option<KeyValues>,
    records_read: u64,
    done: bool,
}

/// Run `workload`'s map function over the records of `contents`.
///
/// Nothing happens until the returned iterator is pulled. The first error
/// ends the iteration.
pub fn run_map(
    contents: &SplitContents,
    workload: &Workload,
    aux: Bytes,
    ctx: TaskContext,
) -> MapRun {
    MapRun {
        split: contents.resource.clone(),
        records: contents.records(),
        map_fn: workload.map_fn,
        aux,
        ctx,
        current: None,
        records_read: 0,
        done: false,
    }
}

impl MapRun {
    /// Input records handed to the map function so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    fn fail(&mut self, source: anyhow::Error) -> Option<Result<KeyValue>> {
        self.done = true;
        Some(Err(MrError::MapExecution {
            split: self.split.clone(),
            source,
        }))
    }
}

impl Iterator for MapRun {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Result<KeyValue>> {
        if self.done {
            return None;
        }

        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(kv)) => return Some(Ok(kv)),
                    Some(Err(e)) => return self.fail(e),
                    None => self.current = None,
                }
            }

            let record = self.records.next()?;
            if let Err(e) = self.ctx.tick() {
                self.done = true;
                return Some(Err(e));
            }
            self.records_read += 1;

            let offset = String::from_utf8_lossy(&record.key).into_owned();
            match (self.map_fn)(record, self.aux.clone())
                .with_context(|| format!("record at offset {offset}"))
            {
                Ok(emitted) => self.current = Some(emitted),
                Err(e) => return self.fail(e),
            }
        }
    }
}

/// The body of one map attempt, after the split has been read: run the map
/// function and buffer, sort and spill everything it emits.
///
/// Blocking; runs on the blocking pool.
pub fn execute_map(
    contents: &SplitContents,
    workload: &Workload,
    aux: Bytes,
    mut buffer: MapOutputBuffer,
    ctx: TaskContext,
) -> Result<ShuffleOutput> {
    let mut run = run_map(contents, workload, aux, ctx);
    for kv in run.by_ref() {
        buffer.push(kv?)?;
    }
    let mut output = buffer.finish()?;
    output.input_records = run.records_read();
    Ok(output)
}

/// Bytes for the auxiliary argument of a job: the arguments joined by
/// single spaces.
pub fn aux_bytes(args: &[String]) -> Bytes {
    let mut aux = BytesMut::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            aux.extend_from_slice(b" ");
        }
        aux.extend_from_slice(arg.as_bytes());
    }
    aux.freeze()
}
