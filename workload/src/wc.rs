//! A MapReduce-compatible application that counts the occurrences of each
//! whitespace-separated word in the input.

use std::iter;

use anyhow::Context;
use bytes::Bytes;

use common::utils::parse_decimal;
use common::{KeyValue, MapOutput, ReduceOutput};

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let line = kv.into_value();
    let words: Vec<Bytes> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| line.slice_ref(word))
        .collect();

    let iter = words
        .into_iter()
        .map(|word| Ok(KeyValue::new(word, Bytes::from_static(b"1"))));
    Ok(Box::new(iter))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> ReduceOutput {
    let mut count = 0u64;
    for value in values {
        count += parse_decimal(&value)
            .with_context(|| format!("bad count for `{}`", String::from_utf8_lossy(&key)))?;
    }

    Ok(Box::new(iter::once(Ok(KeyValue::new(
        key,
        count.to_string(),
    )))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_map(line: &'static str) -> Vec<KeyValue> {
        map(KeyValue::new("0", line), Bytes::new())
            .unwrap()
            .collect::<anyhow::Result<_>>()
            .unwrap()
    }

    #[test]
    fn map_splits_on_runs_of_whitespace() {
        let words: Vec<_> = run_map("  the quick\t\tfox  ")
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(words, vec!["the", "quick", "fox"]);
        assert!(run_map("   ").is_empty());
    }

    #[test]
    fn reduce_sums_counts() {
        let values = vec![Bytes::from("1"), Bytes::from("2"), Bytes::from("1")];
        let out: Vec<_> = reduce(Bytes::from("the"), Box::new(values.into_iter()), Bytes::new())
            .unwrap()
            .collect::<anyhow::Result<_>>()
            .unwrap();
        assert_eq!(out, vec![KeyValue::new("the", "4")]);
    }

    #[test]
    fn reduce_rejects_non_numbers() {
        let values = vec![Bytes::from("one")];
        assert!(reduce(Bytes::from("the"), Box::new(values.into_iter()), Bytes::new()).is_err());
    }
}
