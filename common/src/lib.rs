//! Users can specify map and reduce functions, and then run them as a
//! batch job over split input. Shared types live here: key-value pairs,
//! the workload function signatures, partition hashing, the error taxonomy
//! and the storage interface every other crate reads and writes through.

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hasher;

use bytes::Bytes;

pub mod error;
pub mod storage;
pub mod utils;

pub use error::{ErrorKind, MrError, Result};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// A lazily produced sequence of key-value pairs.
///
/// There are 2 layers of [`anyhow::Result`]s around it. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all keys emitted at once) and lazy
/// (keys only emitted when the iterator is consumed) operations.
pub type KeyValues = Box<dyn Iterator<Item = anyhow::Result<KeyValue>>>;

/// The output of an application map function.
pub type MapOutput = anyhow::Result<KeyValues>;

/// The output of an application reduce function.
pub type ReduceOutput = anyhow::Result<KeyValues>;

/// A map function takes a key-value pair and auxiliary arguments.
///
/// For line input the key is the decimal byte offset of the line and the
/// value is the line itself. It returns an iterator that yields new
/// key-value pairs.
pub type MapFn = fn(kv: KeyValue, aux: Bytes) -> MapOutput;

/// A reduce function takes in a key, an iterator over values for that key,
/// and an auxiliary argument.
///
/// The value iterator is single-pass and only lives for the duration of the
/// call, so the function must consume what it needs before returning. It
/// returns an iterator over the output records for the key.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> ReduceOutput;

/// A map reduce application.
#[derive(Copy, Clone, Debug)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,

    /// The value.
    pub value: Bytes,
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value)
        )
    }
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Get the key of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// Get the value of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> Bytes {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> Bytes {
        self.value
    }

    /// Bytes this pair occupies once serialized, without framing.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Hashes an intermediate key. Compute a reduce bucket for a given key
/// by calculating `ihash(key) % n_reduce`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    (hasher.finish() & 0x7fffffff) as u32
}

/// The reduce partition owning `key` when the job runs `reduce_count`
/// reducers.
#[inline]
pub fn partition_for(key: &[u8], reduce_count: u32) -> u32 {
    debug_assert!(reduce_count > 0);
    ihash(key) % reduce_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihash_is_stable_and_non_negative() {
        let a = ihash(b"the");
        assert_eq!(a, ihash(b"the"));
        assert!(a <= 0x7fffffff);
        assert_ne!(ihash(b"the"), ihash(b"fox"));
    }

    #[test]
    fn partition_for_stays_in_range() {
        for reduce_count in 1..16 {
            for word in ["the", "quick", "fox", "", "lazy", "dog"] {
                assert!(partition_for(word.as_bytes(), reduce_count) < reduce_count);
            }
        }
        assert_eq!(partition_for(b"anything", 1), 0);
    }

    #[test]
    fn display_is_lossy_on_invalid_utf8() {
        let kv = KeyValue::new(Bytes::from_static(b"k\xff"), "v");
        assert_eq!(kv.to_string(), "k\u{fffd} v");
        assert_eq!(kv.payload_len(), 3);
    }
}
