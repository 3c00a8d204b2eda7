//! Human-readable cache size specifications.
//!
//! A size is either absolute (`"200GiB"`, `"500MB"`, `"1.5G"`) or a
//! percentage of the free space on the cache filesystem (`"80%"`). Both SI
//! (KB, MB, GB, TB) and IEC (KiB, MiB, GiB, TiB) units are accepted; the
//! bare shorthands K, M, G, T are treated as IEC.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizeError {
    #[error("empty size string")]
    Empty,
    #[error("invalid size format: {0}")]
    InvalidFormat(String),
    #[error("unknown unit: {0}")]
    UnknownUnit(String),
    #[error("size out of range: {0}")]
    OutOfRange(String),
}

/// Disk budget for the mirror store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeSpec {
    /// Fixed byte count.
    Absolute(u64),
    /// Percentage of the available space on the cache filesystem,
    /// in the open-closed interval (0, 100].
    Percent(f64),
}

impl FromStr for SizeSpec {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, SizeError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SizeError::Empty);
        }

        if let Some(num) = s.strip_suffix('%') {
            let pct: f64 = num
                .trim()
                .parse()
                .map_err(|_| SizeError::InvalidFormat(s.to_string()))?;
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(SizeError::OutOfRange(s.to_string()));
            }
            return Ok(SizeSpec::Percent(pct));
        }

        parse_size(s).map(SizeSpec::Absolute)
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeSpec::Absolute(bytes) => write!(f, "{}", format_size(*bytes)),
            SizeSpec::Percent(pct) => write!(f, "{pct}%"),
        }
    }
}

/// Parse an absolute size like `"200GiB"`, `"200GB"` or `"1.5G"` into bytes.
///
/// Decimal values are permitted; the resulting byte count truncates toward
/// zero. Negative values are rejected as out of range.
pub fn parse_size(s: &str) -> Result<u64, SizeError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SizeError::Empty);
    }
    if s.starts_with('-') {
        return Err(SizeError::OutOfRange(s.to_string()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    let unit = unit.trim();

    if num_str.is_empty() || !unit.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(SizeError::InvalidFormat(s.to_string()));
    }

    let num: f64 = num_str
        .parse()
        .map_err(|_| SizeError::InvalidFormat(s.to_string()))?;

    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        // IEC units (base 1024); bare shorthand is treated as IEC too.
        "KIB" | "K" => 1 << 10,
        "MIB" | "M" => 1 << 20,
        "GIB" | "G" => 1 << 30,
        "TIB" | "T" => 1 << 40,
        // SI units (base 1000)
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        _ => return Err(SizeError::UnknownUnit(unit.to_string())),
    };

    Ok((num * multiplier as f64) as u64)
}

/// Format a byte count using IEC units, e.g. `1536` becomes `"1.5 KiB"`.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}iB", bytes as f64 / div as f64, ['K', 'M', 'G', 'T', 'P', 'E'][exp])
}
