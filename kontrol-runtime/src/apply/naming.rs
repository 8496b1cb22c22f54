//! Deterministic, RFC-1123-safe name generation for applied children.
//!
//! Ported from `pkg/name/name.go`'s `SafeConcatNameWithSeparatorAndLength` /
//! `SafeConcatName`: join non-empty parts with a separator; if the join fits, use it
//! as-is; otherwise replace the tail with a hex slice of the SHA-256 digest of the
//! full joined string, choosing a 5- or 6-hex-char tail depending on whether the
//! character right before the cut is a lowercase letter or digit (so the result never
//! ends up with the separator immediately preceding the hash, which Kubernetes name
//! validation rejects).

use sha2::{Digest, Sha256};

const DEFAULT_LENGTH: usize = 64;
const DEFAULT_SEPARATOR: &str = "-";

/// Join `parts` with `sep`, hashing the tail down to fit within `length` bytes if needed.
#[must_use]
pub fn safe_concat_name_with_separator_and_length(length: usize, sep: &str, parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(sep);

    if joined.len() < length {
        return joined;
    }

    let digest = Sha256::digest(joined.as_bytes());
    let hex = hex_encode(&digest);

    // `length - 8` is a byte index into `joined`; `joined` is ASCII at this point in
    // every caller (Kubernetes names are already restricted to DNS-safe characters),
    // so byte indexing into the UTF-8 string is sound.
    let marker = joined.as_bytes()[length - 8];
    if marker.is_ascii_lowercase() || marker.is_ascii_digit() {
        format!("{}{sep}{}", &joined[..length - 7], &hex[..5])
    } else {
        format!("{}{sep}{}", &joined[..length - 8], &hex[..6])
    }
}

/// `safe_concat_name_with_separator_and_length(64, "-", parts)`.
#[must_use]
pub fn safe_concat_name(parts: &[&str]) -> String {
    safe_concat_name_with_separator_and_length(DEFAULT_LENGTH, DEFAULT_SEPARATOR, parts)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_pass_through_unchanged() {
        assert_eq!(safe_concat_name(&["foo", "bar"]), "foo-bar");
    }

    #[test]
    fn blank_parts_are_dropped() {
        assert_eq!(safe_concat_name(&["foo", "  ", "bar"]), "foo-bar");
    }

    #[test]
    fn long_names_are_hashed_and_stay_under_length() {
        let long = "a".repeat(100);
        let result = safe_concat_name(&[&long]);
        assert!(result.len() <= 64);
        assert!(result.starts_with(&"a".repeat(57)));
    }

    #[test]
    fn hashed_output_is_deterministic() {
        let long = "x".repeat(80);
        let a = safe_concat_name(&[&long]);
        let b = safe_concat_name(&[&long]);
        assert_eq!(a, b);
    }
}
