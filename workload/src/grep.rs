//! Distributed grep: finds the lines containing the pattern passed as the
//! auxiliary argument, and counts how often each one occurs.

use std::iter;

use anyhow::{bail, Context};
use bytes::Bytes;

use common::utils::parse_decimal;
use common::{KeyValue, MapOutput, ReduceOutput};

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

pub fn map(kv: KeyValue, aux: Bytes) -> MapOutput {
    if aux.is_empty() {
        bail!("grep needs a pattern as its auxiliary argument");
    }

    let line = kv.into_value();
    let hit = contains(&line, &aux).then(|| Ok(KeyValue::new(line, Bytes::from_static(b"1"))));
    Ok(Box::new(hit.into_iter()))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> ReduceOutput {
    let mut matches = 0u64;
    for value in values {
        matches += parse_decimal(&value).context("bad match count")?;
    }

    Ok(Box::new(iter::once(Ok(KeyValue::new(
        key,
        matches.to_string(),
    )))))
}
