//! Virtual path (VPath) primitives
//!
//! A VPath is an absolute, `/`-rooted string whose segments are
//! percent-encoded. The same representation is used on the OS layer and
//! inside archives, so every store key and comparison is expressed on VPaths.
//!
//! ## Rules
//!
//! - Must start with `/`. The root is exactly `/`.
//! - Segments are non-empty and never contain an unencoded `/`.
//! - `.` segments collapse; `..` segments are rejected rather than resolved.
//! - Segment bytes outside `A-Z a-z 0-9 - . _ ~` are written as `%XX`
//!   with uppercase hex.
//!
//! ## Case folding
//!
//! [`fold`] lowercases ASCII `A-Z` only. Percent escapes and non-ASCII
//! characters pass through untouched, so two paths that differ only in the
//! case of a non-ASCII letter stay distinct even under an insensitive policy.
//!
//! ## Examples
//!
//! ```rust
//! use treesnap::vpath;
//! use treesnap::types::CasePolicy;
//!
//! # fn main() -> treesnap::Result<()> {
//! let path = vpath::normalize("/Docs/./Report.PDF")?;
//! assert_eq!(path, "/Docs/Report.PDF");
//! assert_eq!(vpath::key(&path, CasePolicy::Insensitive), "/docs/report.pdf");
//! assert_eq!(vpath::append("/Docs", "a b.txt"), "/Docs/a%20b.txt");
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, TreesnapError};
use crate::types::{CasePolicy, ErrorCode};
use std::borrow::Cow;

/// The root vpath
pub const ROOT: &str = "/";

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

/// Normalize a vpath string
///
/// # Errors
///
/// - `InvalidVpathFormat` if the value does not start with `/` or has an
///   empty segment (`//`, trailing `/`)
/// - `InvalidVpathParentSegment` if any segment is `..`
pub fn normalize(value: &str) -> Result<String> {
    if !value.starts_with('/') {
        return Err(TreesnapError::invalid_vpath(
            ErrorCode::InvalidVpathFormat,
            format!("VPath must start with \"/\": {:?}", value),
        ));
    }
    if value == ROOT {
        return Ok(ROOT.to_string());
    }

    let mut out = String::with_capacity(value.len());
    for part in value[1..].split('/') {
        match part {
            "" => {
                return Err(TreesnapError::invalid_vpath(
                    ErrorCode::InvalidVpathFormat,
                    format!("VPath contains empty segment: {:?}", value),
                ))
            }
            "." => continue,
            ".." => {
                return Err(TreesnapError::invalid_vpath(
                    ErrorCode::InvalidVpathParentSegment,
                    format!("VPath parent segment not allowed: {:?}", value),
                ))
            }
            segment => {
                out.push('/');
                out.push_str(segment);
            }
        }
    }

    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Fold ASCII letters to lowercase, leaving `%XX` escapes and non-ASCII intact
pub fn fold(vpath: &str) -> String {
    let bytes = vpath.as_bytes();
    let mut out = String::with_capacity(vpath.len());
    let mut chars = vpath.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if ch == '%'
            && idx + 2 < bytes.len()
            && bytes[idx + 1].is_ascii_hexdigit()
            && bytes[idx + 2].is_ascii_hexdigit()
        {
            out.push_str(&vpath[idx..idx + 3]);
            chars.next();
            chars.next();
            continue;
        }
        out.push(ch.to_ascii_lowercase());
    }
    out
}

/// Comparison key of a vpath under a resolved case policy
///
/// `Auto` must be resolved by the caller; it is treated as sensitive here.
pub fn key(vpath: &str, policy: CasePolicy) -> Cow<'_, str> {
    match policy {
        CasePolicy::Insensitive => Cow::Owned(fold(vpath)),
        CasePolicy::Sensitive | CasePolicy::Auto => Cow::Borrowed(vpath),
    }
}

/// Whether `vpath` equals `prefix` or lies under it
pub fn has_prefix(vpath: &str, prefix: &str) -> bool {
    if prefix == ROOT || vpath == prefix {
        return true;
    }
    vpath.len() > prefix.len() && vpath.starts_with(prefix) && vpath.as_bytes()[prefix.len()] == b'/'
}

/// Whether `child` is exactly one segment below `parent`
pub fn is_immediate_child(parent: &str, child: &str) -> bool {
    let rest = if parent == ROOT {
        match child.strip_prefix('/') {
            Some(rest) => rest,
            None => return false,
        }
    } else {
        match child.strip_prefix(parent).and_then(|r| r.strip_prefix('/')) {
            Some(rest) => rest,
            None => return false,
        }
    };
    !rest.is_empty() && !rest.contains('/')
}

/// Concatenate two vpaths, treating `/` as the identity
pub fn join(a: &str, b: &str) -> String {
    if a == ROOT {
        return b.to_string();
    }
    if b == ROOT {
        return a.to_string();
    }
    format!("{}{}", a, b)
}

/// Parent vpath; `None` for the root
pub fn parent(vpath: &str) -> Option<String> {
    if vpath == ROOT {
        return None;
    }
    match vpath.rfind('/') {
        Some(idx) if idx > 0 => Some(vpath[..idx].to_string()),
        _ => Some(ROOT.to_string()),
    }
}

/// Last segment of a vpath, still encoded (empty for the root)
pub fn last_segment(vpath: &str) -> &str {
    match vpath.rfind('/') {
        Some(idx) => &vpath[idx + 1..],
        None => vpath,
    }
}

/// Percent-encode one name into a vpath segment
pub fn encode_segment(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &byte in name.as_bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Build a vpath from decoded names
pub fn encode_segments<S: AsRef<str>>(segments: &[S]) -> String {
    if segments.is_empty() {
        return ROOT.to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&encode_segment(segment.as_ref()));
    }
    out
}

/// Append a decoded name to a vpath
pub fn append(parent: &str, name: &str) -> String {
    let segment = encode_segment(name);
    if parent == ROOT {
        format!("/{}", segment)
    } else {
        format!("{}/{}", parent, segment)
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Decode one percent-encoded segment into its name
///
/// # Errors
///
/// - `InvalidVpathFormat` for a truncated or non-hex escape
/// - `EncodingError` if the decoded bytes are not UTF-8
pub fn decode_segment(segment: &str) -> Result<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escape = bytes
                .get(i + 1)
                .zip(bytes.get(i + 2))
                .and_then(|(hi, lo)| Some(hex_value(*hi)? * 16 + hex_value(*lo)?));
            match escape {
                Some(byte) => out.push(byte),
                None => {
                    return Err(TreesnapError::invalid_vpath(
                        ErrorCode::InvalidVpathFormat,
                        format!("Invalid percent encoding in segment {:?}", segment),
                    ))
                }
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| {
        TreesnapError::invalid_vpath(
            ErrorCode::EncodingError,
            format!("Segment {:?} does not decode to UTF-8", segment),
        )
    })
}

/// Decode every segment of a vpath
pub fn decode_segments(vpath: &str) -> Result<Vec<String>> {
    if !vpath.starts_with('/') {
        return Err(TreesnapError::invalid_vpath(
            ErrorCode::InvalidVpathFormat,
            format!("VPath must start with \"/\": {:?}", vpath),
        ));
    }
    if vpath == ROOT {
        return Ok(Vec::new());
    }
    vpath[1..]
        .split('/')
        .map(|part| {
            if part.is_empty() {
                Err(TreesnapError::invalid_vpath(
                    ErrorCode::InvalidVpathFormat,
                    format!("VPath contains empty segment: {:?}", vpath),
                ))
            } else {
                decode_segment(part)
            }
        })
        .collect()
}
