//! A MapReduce-compatible application that computes the
//! degree of each vertex in a graph, given a list of edges.
//!
//! Every input line is one edge `a b`. Blank lines and lines starting
//! with `#` are ignored.

use std::iter;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;

use common::utils::{parse_decimal, string_from_bytes};
use common::{KeyValue, MapOutput, ReduceOutput};

fn parse_line(line: &str) -> Result<(u64, u64)> {
    let mut iter = line.split_whitespace().take(2);
    let a = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    let b = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    Ok((a, b))
}

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let offset = kv.key();
    let s = string_from_bytes(kv.into_value())?;
    let line = s.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(Box::new(iter::empty()));
    }

    let (a, b) = parse_line(line)
        .with_context(|| format!("bad edge at offset {}", String::from_utf8_lossy(&offset)))?;

    let iter = [a, b]
        .into_iter()
        .map(|vertex| Ok(KeyValue::new(vertex.to_string(), Bytes::from_static(b"1"))));
    Ok(Box::new(iter))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> ReduceOutput {
    let mut count = 0u64;

    for value in values {
        count += parse_decimal(&value)?;
    }

    Ok(Box::new(iter::once(Ok(KeyValue::new(
        key,
        format!("deg={count}"),
    )))))
}
