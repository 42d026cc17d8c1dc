//! Spill segments.
//!
//! A segment is a file of `u32 key_len | key | u32 value_len | value`
//! frames (big-endian lengths), sorted by partition and then by key. The
//! index kept next to it locates each partition's run of frames.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use tracing::warn;

use common::{KeyValue, MrError, Result};

const FRAME_HEADER: u64 = 4;

/// Base pause before re-reading a segment, scaled by the failure count and
/// jittered.
pub const RETRY_DELAY: Duration = Duration::from_millis(20);

fn frame_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {len} bytes does not fit a u32 length"),
        )
    })
}

/// Where one partition's records live inside a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionRange {
    pub offset: u64,
    pub length: u64,
    pub records: u64,
}

/// A spill file and its per-partition index.
#[derive(Debug, Clone)]
pub struct SpillSegment {
    pub path: PathBuf,
    pub index: Vec<PartitionRange>,
}

impl SpillSegment {
    /// Write `sorted`, which must be ordered by partition, to a new file at
    /// `path`.
    pub fn write(path: &Path, reduce_count: u32, sorted: &[(u32, KeyValue)]) -> Result<Self> {
        let io_err = |e| MrError::shuffle_io(format!("writing {}", path.display()), e);

        let file = File::create(path).map_err(io_err)?;
        let mut out = BufWriter::new(file);
        let mut index = vec![PartitionRange::default(); reduce_count as usize];
        let mut frame = BytesMut::new();
        let mut offset = 0u64;

        for (partition, kv) in sorted {
            frame.put_u32(frame_len(kv.key.len()).map_err(io_err)?);
            frame.put_slice(&kv.key);
            frame.put_u32(frame_len(kv.value.len()).map_err(io_err)?);
            frame.put_slice(&kv.value);
            out.write_all(&frame).map_err(io_err)?;

            let range = &mut index[*partition as usize];
            if range.records == 0 {
                range.offset = offset;
            }
            range.length += frame.len() as u64;
            range.records += 1;
            offset += frame.len() as u64;
            frame.clear();
        }

        out.flush().map_err(io_err)?;
        out.get_ref().sync_data().map_err(io_err)?;

        Ok(Self {
            path: path.to_path_buf(),
            index,
        })
    }

    pub fn range(&self, partition: u32) -> PartitionRange {
        self.index
            .get(partition as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn len(&self) -> u64 {
        self.index.iter().map(|r| r.length).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads the frames of one partition range.
pub struct SegmentReader {
    reader: Take<BufReader<File>>,
    remaining: u64,
}

impl SegmentReader {
    pub fn open(path: &Path, range: PartitionRange) -> io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(range.offset))?;
        Ok(Self {
            reader: BufReader::new(file).take(range.length),
            remaining: range.records,
        })
    }

    fn read_frame(&mut self) -> io::Result<Bytes> {
        let mut header = [0u8; FRAME_HEADER as usize];
        self.reader.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header) as u64;
        if len > self.reader.limit() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes overruns its partition range"),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    pub fn next_record(&mut self) -> io::Result<Option<KeyValue>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let key = self.read_frame()?;
        let value = self.read_frame()?;
        self.remaining -= 1;
        Ok(Some(KeyValue { key, value }))
    }
}

/// A partition range of a segment as a record source for the merge.
///
/// A failed read reopens the segment and skips what was already handed
/// out, up to `retries` times, before the error is reported.
///
/// Blocking: a retry sleeps the calling thread first.
pub struct SegmentSource {
    path: PathBuf,
    range: PartitionRange,
    retries: u32,
    retry_delay: Duration,
    reader: Option<SegmentReader>,
    consumed: u64,
    done: bool,
}

impl SegmentSource {
    pub fn new(path: PathBuf, range: PartitionRange, retries: u32) -> Self {
        Self {
            path,
            range,
            retries,
            retry_delay: RETRY_DELAY,
            reader: None,
            consumed: 0,
            done: range.records == 0,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    fn backoff(&self, failures: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        self.retry_delay.mul_f64(jitter) * failures
    }

    fn try_next(&mut self) -> io::Result<Option<KeyValue>> {
        if self.reader.is_none() {
            let mut reader = SegmentReader::open(&self.path, self.range)?;
            for _ in 0..self.consumed {
                reader.next_record()?;
            }
            self.reader = Some(reader);
        }
        match self.reader.as_mut() {
            Some(reader) => reader.next_record(),
            None => Ok(None),
        }
    }
}

impl Iterator for SegmentSource {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Result<KeyValue>> {
        if self.done {
            return None;
        }

        let mut failures = 0;
        loop {
            match self.try_next() {
                Ok(Some(kv)) => {
                    self.consumed += 1;
                    return Some(Ok(kv));
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) if failures < self.retries => {
                    failures += 1;
                    warn!(
                        "read of {} failed ({e}), retry {failures}/{}",
                        self.path.display(),
                        self.retries
                    );
                    self.reader = None;
                    std::thread::sleep(self.backoff(failures));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(MrError::shuffle_io(
                        format!("reading {}", self.path.display()),
                        e,
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted() -> Vec<(u32, KeyValue)> {
        vec![
            (0, KeyValue::new("a", "1")),
            (0, KeyValue::new("b", "22")),
            (2, KeyValue::new("c", "")),
        ]
    }

    fn read_range(segment: &SpillSegment, partition: u32) -> Vec<KeyValue> {
        SegmentSource::new(segment.path.clone(), segment.range(partition), 0)
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn index_locates_each_partition() {
        let dir = tempfile::tempdir().unwrap();
        let segment = SpillSegment::write(&dir.path().join("spill-0.seg"), 3, &sorted()).unwrap();

        assert_eq!(segment.range(0).records, 2);
        assert_eq!(segment.range(1), PartitionRange::default());
        assert_eq!(segment.range(2).offset, segment.range(0).length);
        assert_eq!(segment.len(), (8 + 2) + (8 + 3) + (8 + 1));

        assert_eq!(
            read_range(&segment, 0),
            vec![KeyValue::new("a", "1"), KeyValue::new("b", "22")]
        );
        assert!(read_range(&segment, 1).is_empty());
        assert_eq!(read_range(&segment, 2), vec![KeyValue::new("c", "")]);
    }

    #[test]
    fn truncated_segment_is_a_shuffle_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill-0.seg");
        let segment = SpillSegment::write(&path, 3, &sorted()).unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(segment.range(0).length - 1).unwrap();

        let mut source = SegmentSource::new(path, segment.range(0), 2);
        assert!(source.next().unwrap().is_ok());
        let err = source.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::ShuffleIo);
        assert!(source.next().is_none());
    }

    #[test]
    fn missing_segment_fails_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let range = PartitionRange {
            offset: 0,
            length: 10,
            records: 1,
        };
        let mut source = SegmentSource::new(dir.path().join("gone.seg"), range, 3)
            .with_retry_delay(Duration::from_millis(1));
        assert!(source.next().unwrap().is_err());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        assert_eq!(frame_len(7).unwrap(), 7);
        assert_eq!(frame_len(u32::MAX as usize).unwrap(), u32::MAX);
        let err = frame_len(u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn read_resumes_after_the_segment_comes_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill-0.seg");
        // Values larger than the read buffer, so later records come from
        // the file rather than from what the first read buffered.
        let records: Vec<(u32, KeyValue)> = ["a", "b", "c", "d"]
            .iter()
            .map(|k| (0, KeyValue::new(*k, k.repeat(6000))))
            .collect();
        let segment = SpillSegment::write(&path, 1, &records).unwrap();
        let contents = std::fs::read(&path).unwrap();

        let mut source = SegmentSource::new(path.clone(), segment.range(0), 3)
            .with_retry_delay(Duration::from_millis(300));
        let mut seen = vec![source.next().unwrap().unwrap()];

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();
        let restore = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                std::fs::write(path, contents).unwrap();
            })
        };

        seen.extend(source.by_ref().map(|kv| kv.unwrap()));
        restore.join().unwrap();

        let expected: Vec<KeyValue> = records.into_iter().map(|(_, kv)| kv).collect();
        assert_eq!(seen, expected);
        assert!(source.next().is_none());
    }
}
