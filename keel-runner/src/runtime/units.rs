//! Memory size strings

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;

static RAM_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?) ?([kKmMgGtTpP])?[iI]?[bB]?$").expect("static regex is valid")
});

/// Parses a human memory size such as `512m`, `1.5GiB` or `2048` into bytes
///
/// Units are binary multiples. An empty string means no limit.
pub fn ram_in_bytes(size: &str) -> Result<Option<i64>> {
    let size = size.trim();
    if size.is_empty() {
        return Ok(None);
    }

    let Some(captures) = RAM_SIZE.captures(size) else {
        bail!("invalid memory size: '{}'", size);
    };

    let value: f64 = captures[1]
        .parse()
        .with_context(|| format!("invalid memory size: '{}'", size))?;

    let multiplier: f64 = match captures.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1.0,
        Some(unit) => match unit.as_str() {
            "k" => 1024.0,
            "m" => 1024.0 * 1024.0,
            "g" => 1024.0 * 1024.0 * 1024.0,
            "t" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            "p" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
            other => bail!("invalid memory unit: '{}'", other),
        },
    };

    Ok(Some((value * multiplier) as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_in_bytes() {
        assert_eq!(ram_in_bytes("32").unwrap(), Some(32));
        assert_eq!(ram_in_bytes("32b").unwrap(), Some(32));
        assert_eq!(ram_in_bytes("32k").unwrap(), Some(32 * 1024));
        assert_eq!(ram_in_bytes("32KiB").unwrap(), Some(32 * 1024));
        assert_eq!(ram_in_bytes("512m").unwrap(), Some(512 * 1024 * 1024));
        assert_eq!(ram_in_bytes("1.5g").unwrap(), Some(1536 * 1024 * 1024));
        assert_eq!(ram_in_bytes("2 GB").unwrap(), Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_ram_in_bytes_empty_and_invalid() {
        assert_eq!(ram_in_bytes("").unwrap(), None);
        assert!(ram_in_bytes("lots").is_err());
        assert!(ram_in_bytes("12x").is_err());
        assert!(ram_in_bytes("-1m").is_err());
    }
}
