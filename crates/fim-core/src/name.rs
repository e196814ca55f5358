//! Reversible text form of on-disk names. Bytes that are not valid UTF-8,
//! and the escape character itself, are written as `%XX`.

use std::ffi::{OsStr, OsString};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed escape in '{0}'")]
pub struct MalformedEscape(pub String);

/// Logical form of one path component.
pub fn encode(name: &OsStr) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        encode_bytes(name.as_bytes())
    }
    #[cfg(not(unix))]
    {
        encode_bytes(name.to_string_lossy().as_bytes())
    }
}

fn encode_bytes(mut bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    while !bytes.is_empty() {
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                push_text(&mut out, text);
                break;
            }
            Err(e) => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                if let Ok(text) = std::str::from_utf8(valid) {
                    push_text(&mut out, text);
                }
                let bad = e.error_len().unwrap_or(rest.len());
                for byte in &rest[..bad] {
                    let _ = write!(out, "%{byte:02X}");
                }
                bytes = &rest[bad..];
            }
        }
    }
    out
}

fn push_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            c => out.push(c),
        }
    }
}

/// On-disk form of a logical path or path suffix.
pub fn decode(logical: &str) -> Result<OsString, MalformedEscape> {
    let raw = logical.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let byte = raw
                .get(i + 1..i + 3)
                .and_then(|hex| hex::decode(hex).ok())
                .and_then(|decoded| decoded.first().copied())
                .ok_or_else(|| MalformedEscape(logical.to_string()))?;
            bytes.push(byte);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        Ok(OsString::from_vec(bytes))
    }
    #[cfg(not(unix))]
    {
        Ok(OsString::from(String::from_utf8_lossy(&bytes).into_owned()))
    }
}
