use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use common::{KeyValue, MrError, Result};

use super::RecordSource;

#[derive(Debug)]
struct Head {
    kv: KeyValue,
    source: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kv
            .key
            .cmp(&other.kv.key)
            .then(self.source.cmp(&other.source))
    }
}

/// K-way merge of sorted record sources.
///
/// Records come out ordered by key. Equal keys come out in source order,
/// and in emission order within one source.
pub struct MergeIter {
    sources: Vec<RecordSource>,
    heap: BinaryHeap<Reverse<Head>>,
    primed: bool,

    /// A read error to report after the record popped alongside it.
    pending: Option<MrError>,
    failed: bool,
}

impl MergeIter {
    pub fn new(sources: Vec<RecordSource>) -> Self {
        let heap = BinaryHeap::with_capacity(sources.len());
        Self {
            sources,
            heap,
            primed: false,
            pending: None,
            failed: false,
        }
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        match self.sources[source].next() {
            Some(Ok(kv)) => {
                self.heap.push(Reverse(Head { kv, source }));
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    fn fail(&mut self, e: MrError) -> Option<Result<KeyValue>> {
        self.failed = true;
        Some(Err(e))
    }
}

impl Iterator for MergeIter {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Result<KeyValue>> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending.take() {
            return self.fail(e);
        }
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                if let Err(e) = self.refill(source) {
                    return self.fail(e);
                }
            }
        }

        let Reverse(head) = self.heap.pop()?;
        if let Err(e) = self.refill(head.source) {
            self.pending = Some(e);
        }
        Some(Ok(head.kv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&'static str, &'static str)]) -> RecordSource {
        let records: Vec<Result<KeyValue>> = pairs
            .iter()
            .map(|(k, v)| Ok(KeyValue::new(*k, *v)))
            .collect();
        Box::new(records.into_iter())
    }

    #[test]
    fn merges_by_key_then_source() {
        let merged: Vec<_> = MergeIter::new(vec![
            source(&[("a", "0"), ("c", "0")]),
            source(&[]),
            source(&[("a", "2"), ("b", "2"), ("c", "2")]),
            source(&[("a", "3")]),
        ])
        .map(|kv| {
            let kv = kv.unwrap();
            format!("{}{}", String::from_utf8_lossy(&kv.key), String::from_utf8_lossy(&kv.value))
        })
        .collect();

        assert_eq!(merged, vec!["a0", "a2", "a3", "b2", "c0", "c2"]);
    }

    #[test]
    fn read_errors_end_the_merge() {
        let broken: RecordSource = Box::new(
            vec![
                Ok(KeyValue::new("a", "1")),
                Err(MrError::Internal("boom".into())),
            ]
            .into_iter(),
        );
        let mut merge = MergeIter::new(vec![broken, source(&[("b", "1")])]);
        assert!(merge.next().unwrap().is_ok());
        assert!(merge.next().unwrap().is_err());
        assert!(merge.next().is_none());
    }
}
