//! Utility functions for treesnap
//!
//! Small helpers shared by the key derivation code, both store backends and
//! the command-line tool.
//!
//! ## Categories of Utilities
//!
//! ### Hashing
//! - SHA-256 of bytes or UTF-8 strings, as lowercase hex
//!
//! ### Ids and instants
//! - Prefixed UUIDs and zero-padded incremental ids
//! - A fixed-width RFC 3339 rendering of instants whose byte order matches
//!   chronological order (the SQL backend sorts on it)
//!
//! ### Display
//! - Human-readable byte sizes

use crate::error::{Result, TreesnapError};
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Hash arbitrary data using SHA-256
///
/// Returns the digest as a 64-character lowercase hexadecimal string.
///
/// # Example
///
/// ```rust,ignore
/// use crate::utils::hash_data;
///
/// let hash = hash_data(b"test");
/// assert_eq!(hash, "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08");
/// ```
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of the UTF-8 bytes of `value`
pub fn hash_str(value: &str) -> String {
    hash_data(value.as_bytes())
}

/// `prefix` followed by a random UUID v4
pub fn prefixed_uuid(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4())
}

/// `prefix` followed by `value` left-padded with zeros to `width` digits
pub fn incremental_id(prefix: &str, value: u64, width: usize) -> String {
    format!("{}{:0width$}", prefix, value, width = width)
}

/// Render an instant as fixed-width RFC 3339 with nanoseconds and `Z`
///
/// Every rendering has the same length, so comparing two strings byte-wise
/// gives the same order as comparing the instants.
pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an instant written by [`format_instant`] (or any RFC 3339 string)
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TreesnapError::corrupt(format!("invalid instant {:?}: {}", value, e)))
}

/// Format bytes as a human-readable string
///
/// Values below 1024 are whole bytes; larger values use binary units with
/// two decimals.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
