use bytes::Bytes;

use common::{KeyValue, MrError, Result};

use crate::task::TaskContext;

/// Groups a key-ordered record stream into `(key, values)`.
///
/// A read error ends the stream early. The reduce task must check
/// [`GroupedStream::take_error`] after each group, since the error may
/// have cut the group short.
pub struct GroupedStream<I: Iterator<Item = Result<KeyValue>>> {
    records: I,
    lookahead: Option<KeyValue>,
    error: Option<MrError>,
    last_key: Option<Bytes>,
    records_read: u64,
    heartbeat: Option<TaskContext>,
}

impl<I: Iterator<Item = Result<KeyValue>>> GroupedStream<I> {
    pub fn new(records: I) -> Self {
        Self {
            records,
            lookahead: None,
            error: None,
            last_key: None,
            records_read: 0,
            heartbeat: None,
        }
    }

    /// Tick `ctx` for every record pulled, so a long group still counts as
    /// progress. A cancelled context ends the stream with its error.
    pub fn set_heartbeat(&mut self, ctx: TaskContext) {
        self.heartbeat = Some(ctx);
    }

    fn pull(&mut self) -> Option<KeyValue> {
        if self.error.is_some() {
            return None;
        }
        if let Some(ctx) = &self.heartbeat {
            if let Err(e) = ctx.tick() {
                self.error = Some(e);
                return None;
            }
        }
        match self.records.next()? {
            Ok(kv) => {
                self.records_read += 1;
                Some(kv)
            }
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }

    /// The next group. Its values borrow the stream, so the group has to be
    /// dropped before asking for the next one.
    pub fn next_group(&mut self) -> Option<(Bytes, Values<'_, I>)> {
        let first = match self.lookahead.take() {
            Some(kv) => kv,
            None => self.pull()?,
        };
        let key = first.key();

        if let Some(last) = &self.last_key {
            if *last >= key {
                self.error = Some(MrError::Internal(format!(
                    "merge produced key {:?} after {:?}",
                    key, last
                )));
                return None;
            }
        }
        self.last_key = Some(key.clone());

        let values = Values {
            stream: self,
            key: key.clone(),
            first: Some(first.into_value()),
            done: false,
        };
        Some((key, values))
    }

    /// Records pulled from the underlying stream so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    pub fn take_error(&mut self) -> Option<MrError> {
        self.error.take()
    }
}

/// The values of one group. Single pass; dropping it skips whatever was
/// not consumed.
pub struct Values<'a, I: Iterator<Item = Result<KeyValue>>> {
    stream: &'a mut GroupedStream<I>,
    key: Bytes,
    first: Option<Bytes>,
    done: bool,
}

impl<I: Iterator<Item = Result<KeyValue>>> Iterator for Values<'_, I> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if let Some(value) = self.first.take() {
            return Some(value);
        }
        if self.done {
            return None;
        }
        match self.stream.pull() {
            Some(kv) if kv.key == self.key => Some(kv.into_value()),
            Some(kv) => {
                self.stream.lookahead = Some(kv);
                self.done = true;
                None
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

impl<I: Iterator<Item = Result<KeyValue>>> Drop for Values<'_, I> {
    fn drop(&mut self) {
        self.first = None;
        while self.next().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn stream(pairs: &[(&'static str, &'static str)]) -> GroupedStream<std::vec::IntoIter<Result<KeyValue>>> {
        let records: Vec<Result<KeyValue>> = pairs
            .iter()
            .map(|(k, v)| Ok(KeyValue::new(*k, *v)))
            .collect();
        GroupedStream::new(records.into_iter())
    }

    #[test]
    fn groups_consecutive_equal_keys() {
        let mut groups = stream(&[("a", "1"), ("a", "2"), ("b", "3"), ("c", "4"), ("c", "5")]);
        let mut seen = Vec::new();
        while let Some((key, values)) = groups.next_group() {
            seen.push((key, values.collect::<Vec<_>>()));
        }
        assert_eq!(
            seen,
            vec![
                (Bytes::from("a"), vec![Bytes::from("1"), Bytes::from("2")]),
                (Bytes::from("b"), vec![Bytes::from("3")]),
                (Bytes::from("c"), vec![Bytes::from("4"), Bytes::from("5")]),
            ]
        );
        assert!(groups.take_error().is_none());
    }

    #[test]
    fn dropping_values_early_skips_the_rest_of_the_group() {
        let mut groups = stream(&[("a", "1"), ("a", "2"), ("a", "3"), ("b", "4")]);
        {
            let (_, mut values) = groups.next_group().unwrap();
            assert_eq!(values.next(), Some(Bytes::from("1")));
        }
        let (key, values) = groups.next_group().unwrap();
        assert_eq!(key, "b");
        assert_eq!(values.collect::<Vec<_>>(), vec![Bytes::from("4")]);
        assert!(groups.next_group().is_none());
    }

    #[test]
    fn out_of_order_input_is_reported() {
        let mut groups = stream(&[("b", "1"), ("a", "2")]);
        while let Some((_, values)) = groups.next_group() {
            drop(values);
        }
        assert_eq!(
            groups.take_error().map(|e| e.kind()),
            Some(common::ErrorKind::Internal)
        );
    }

    #[test]
    fn values_tick_the_heartbeat() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new(token.clone());
        let mut groups = stream(&[("k", "1"), ("k", "2"), ("k", "3")]);
        groups.set_heartbeat(ctx.clone());
        assert!(!ctx.has_started());

        {
            let (_, mut values) = groups.next_group().unwrap();
            assert_eq!(values.next(), Some(Bytes::from("1")));
            assert!(ctx.has_started());
            assert_eq!(values.next(), Some(Bytes::from("2")));

            token.cancel();
            assert_eq!(values.next(), None);
        }
        assert!(groups.next_group().is_none());
        assert!(matches!(groups.take_error(), Some(MrError::Cancelled)));
        assert_eq!(groups.records_read(), 2);
    }
}
