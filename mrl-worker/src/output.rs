//! Partition output files.
//!
//! Each reduce attempt writes its partition to its own directory under
//! `<output>/_temporary`. The coordinator promotes the accepted attempt of
//! every partition once the whole job succeeded.

use bytes::{BufMut, BytesMut};
use tokio::runtime::Handle;

use common::storage::{Storage, StorageWriter};
use common::utils::join_path;
use common::{KeyValue, Result};

pub const TEMPORARY_DIR: &str = "_temporary";

pub const SUCCESS_MARKER: &str = "_SUCCESS";

const FLUSH_AT: usize = 1024 * 1024;

pub fn part_name(partition: u32) -> String {
    format!("mr-out-{partition}")
}

pub fn temporary_dir(output: &str) -> String {
    join_path(output, TEMPORARY_DIR)
}

/// The directory a reduce attempt owns.
pub fn attempt_dir(output: &str, partition: u32, attempt: u32) -> String {
    join_path(&temporary_dir(output), &format!("{partition}_{attempt}"))
}

pub fn attempt_path(output: &str, partition: u32, attempt: u32) -> String {
    join_path(&attempt_dir(output, partition, attempt), &part_name(partition))
}

pub fn final_path(output: &str, partition: u32) -> String {
    join_path(output, &part_name(partition))
}

/// Writes `key\tvalue\n` lines, or `key\n` for an empty value.
///
/// The writer is driven from blocking reduce code and reaches storage
/// through the runtime handle it was created on.
pub struct OutputWriter {
    path: String,
    writer: StorageWriter,
    buf: BytesMut,
    handle: Handle,
    records: u64,
    bytes: u64,
}

impl OutputWriter {
    pub async fn create(storage: &dyn Storage, path: &str) -> Result<Self> {
        let writer = storage.create(path).await?;
        Ok(Self {
            path: path.to_string(),
            writer,
            buf: BytesMut::with_capacity(FLUSH_AT),
            handle: Handle::current(),
            records: 0,
            bytes: 0,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn write(&mut self, kv: &KeyValue) -> Result<()> {
        self.buf.put_slice(&kv.key);
        if !kv.value.is_empty() {
            self.buf.put_u8(b'\t');
            self.buf.put_slice(&kv.value);
        }
        self.buf.put_u8(b'\n');
        self.records += 1;

        if self.buf.len() >= FLUSH_AT {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split();
        self.bytes += chunk.len() as u64;
        self.handle.block_on(self.writer.write_all(&chunk))
    }

    /// Flush and finish the file. Returns the number of records written.
    pub fn close(mut self) -> Result<u64> {
        self.flush()?;
        let Self {
            writer,
            handle,
            records,
            ..
        } = self;
        handle.block_on(writer.finish())?;
        Ok(records)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes + self.buf.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use common::storage::LocalStorage;

    use super::*;

    #[test]
    fn paths() {
        assert_eq!(attempt_path("/out", 3, 2), "/out/_temporary/3_2/mr-out-3");
        assert_eq!(final_path("/out/", 0), "/out/mr-out-0");
    }

    #[test]
    fn writes_tab_separated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let rt = tokio::runtime::Runtime::new().unwrap();

        let mut writer = rt
            .block_on(OutputWriter::create(&storage, "/out/part"))
            .unwrap();
        writer.write(&KeyValue::new("the", "3")).unwrap();
        writer.write(&KeyValue::new("bare", "")).unwrap();
        assert_eq!(writer.bytes_written(), 11);
        assert_eq!(writer.close().unwrap(), 2);

        let written = std::fs::read_to_string(dir.path().join("out/part")).unwrap();
        assert_eq!(written, "the\t3\nbare\n");
    }
}
