use anyhow::{anyhow, Result};
use bytes::Bytes;

/// Convert bytes into an owned UTF-8 string.
pub fn string_from_bytes(bytes: Bytes) -> Result<String> {
    Ok(String::from_utf8(bytes.into())?)
}

/// Parse an unsigned decimal number written as ASCII digits.
pub fn parse_decimal(bytes: &[u8]) -> Result<u64> {
    let s = std::str::from_utf8(bytes)?;
    s.trim()
        .parse::<u64>()
        .map_err(|e| anyhow!("`{s}` is not a decimal count: {e}"))
}

/// Join a storage path and a child name with exactly one separator.
pub fn join_path(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// The final component of a storage path.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Everything before the final component of a storage path.
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(i) => &trimmed[..i],
        None => ".",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths() {
        assert_eq!(join_path("/out", "mr-out-0"), "/out/mr-out-0");
        assert_eq!(join_path("/out/", "/mr-out-0"), "/out/mr-out-0");
        assert_eq!(file_name("/in/a.txt"), "a.txt");
        assert_eq!(file_name("s3://bucket/in/"), "in");
        assert_eq!(parent_path("/in/a.txt"), "/in");
        assert_eq!(parent_path("/a.txt"), "/");
        assert_eq!(parent_path("s3://bucket/in/*.txt"), "s3://bucket/in");
    }

    #[test]
    fn decimals() {
        assert_eq!(parse_decimal(b"42").unwrap(), 42);
        assert_eq!(parse_decimal(b" 7\n").unwrap(), 7);
        assert!(parse_decimal(b"x").is_err());
        assert_eq!(string_from_bytes(Bytes::from_static(b"ok")).unwrap(), "ok");
    }
}
