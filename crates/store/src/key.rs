//! Record key layout.
//!
//! Every stored record is addressed by a 24-byte key:
//!
//! ```text
//! bytes  0..6   millisecond unix timestamp of the span start, big-endian
//! bytes  6..16  random bits (together with 0..6 a ULID-shaped identifier)
//! bytes 16..24  the span id, zero-padded or truncated to 8 bytes
//! ```
//!
//! Bytewise lexicographic order of keys equals chronological order of spans
//! to millisecond resolution; the random bits break ties, so keys never
//! collide within a partition. The span-id tail lets scans identify a span
//! candidate from the key alone, without touching the record value.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rand::RngCore;

use crate::error::StoreError;

pub const KEY_LEN: usize = 24;
pub const SPAN_ID_LEN: usize = 8;
pub const TRACE_ID_LEN: usize = 16;

const TS_LEN: usize = 6;
const RAND_LEN: usize = 10;

/// Big-endian 48-bit millisecond timestamp. Pre-epoch times clamp to zero.
fn millis_be48(t: DateTime<Utc>) -> [u8; TS_LEN] {
    let ms = t.timestamp_millis().max(0) as u64;
    let b = ms.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Build the 24-byte key for a span starting at `start`.
pub fn span_key(
    start: DateTime<Utc>,
    span_id: &[u8],
    rng: &mut dyn RngCore,
) -> Result<[u8; KEY_LEN], StoreError> {
    let mut key = [0u8; KEY_LEN];
    key[..TS_LEN].copy_from_slice(&millis_be48(start));
    rng.try_fill_bytes(&mut key[TS_LEN..TS_LEN + RAND_LEN])
        .map_err(|e| StoreError::KeyGen(e.to_string()))?;
    let n = span_id.len().min(SPAN_ID_LEN);
    key[TS_LEN + RAND_LEN..TS_LEN + RAND_LEN + n].copy_from_slice(&span_id[..n]);
    Ok(key)
}

/// Smallest possible key at time `t`: timestamp followed by all-zero bytes.
pub fn lower_bound(t: DateTime<Utc>) -> [u8; KEY_LEN] {
    let mut key = [0x00u8; KEY_LEN];
    key[..TS_LEN].copy_from_slice(&millis_be48(t));
    key
}

/// Largest possible key at time `t`: timestamp followed by all-ones bytes.
pub fn upper_bound(t: DateTime<Utc>) -> [u8; KEY_LEN] {
    let mut key = [0xFFu8; KEY_LEN];
    key[..TS_LEN].copy_from_slice(&millis_be48(t));
    key
}

/// Millisecond timestamp encoded in a key's first six bytes.
pub fn key_millis(key: &[u8]) -> i64 {
    if key.len() < TS_LEN {
        return 0;
    }
    let mut b = [0u8; 8];
    b[2..].copy_from_slice(&key[..TS_LEN]);
    i64::from_be_bytes(b)
}

/// The span-id tail of a key, or `None` for a key of the wrong length.
pub fn key_suffix(key: &[u8]) -> Option<&[u8]> {
    if key.len() == KEY_LEN {
        Some(&key[TS_LEN + RAND_LEN..])
    } else {
        None
    }
}

/// `YYYY-MM` partition name for a timestamp, in UTC.
pub fn month_name(t: DateTime<Utc>) -> String {
    t.format("%Y-%m").to_string()
}

fn parse_month(name: &str) -> Option<(i32, u32)> {
    let (y, m) = name.split_once('-')?;
    let year: i32 = y.parse().ok()?;
    let month: u32 = m.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some((year, month))
}

/// The first instant of the calendar month after `name`, in UTC.
/// `None` when the name does not parse as `YYYY-MM`.
pub fn end_of_month(name: &str) -> Option<DateTime<Utc>> {
    let (year, month) = parse_month(name)?;
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    Utc.with_ymd_and_hms(ny, nm, 1, 0, 0, 0).single()
}

/// Sorted `YYYY-MM` names for every calendar month touched by
/// `[lower, upper]`, both ends inclusive.
pub fn month_range(lower: DateTime<Utc>, upper: DateTime<Utc>) -> Vec<String> {
    let mut months = Vec::new();
    if upper < lower {
        return months;
    }
    let (mut year, mut month) = (lower.year(), lower.month());
    let (end_year, end_month) = (upper.year(), upper.month());
    loop {
        months.push(format!("{:04}-{:02}", year, month));
        if (year, month) == (end_year, end_month) {
            break;
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    months
}
