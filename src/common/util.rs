use std::borrow::Cow;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A wrapper around `bytes::Bytes` used for request and response bodies.
///
/// Bodies are binary: captured responses may carry gzip or image data that
/// is not valid UTF-8. Cloning is cheap because the underlying buffer is
/// shared.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BodyBytes(pub Bytes);

impl BodyBytes {
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Cheaply clones the bytes into a new `Bytes` instance.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Converts the bytes to a UTF-8 string, potentially lossy.
    /// Tries to parse the input as a UTF-8 string first to avoid copying and
    /// creating an owned instance. If the bytes are not valid UTF-8, invalid
    /// characters are replaced with the Unicode replacement character.
    pub fn to_maybe_lossy_str(&self) -> Cow<str> {
        match std::str::from_utf8(&self.0) {
            Ok(valid_str) => Cow::Borrowed(valid_str),
            Err(_) => Cow::Owned(String::from_utf8_lossy(&self.0).to_string()),
        }
    }
}

impl From<Bytes> for BodyBytes {
    fn from(value: Bytes) -> Self {
        BodyBytes(value)
    }
}

impl From<Vec<u8>> for BodyBytes {
    fn from(value: Vec<u8>) -> Self {
        BodyBytes(Bytes::from(value))
    }
}

impl From<String> for BodyBytes {
    fn from(value: String) -> Self {
        BodyBytes(Bytes::from(value))
    }
}

impl From<&str> for BodyBytes {
    fn from(value: &str) -> Self {
        BodyBytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl PartialEq for BodyBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for BodyBytes {}

impl AsRef<[u8]> for BodyBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// Converts a header name to its canonical MIME-title-case form, e.g.
/// `content-type` becomes `Content-Type` and `x-trace` becomes `X-Trace`.
///
/// Header names are case-insensitive on the wire but stored under a single
/// canonical spelling so that template matching does not fail from case
/// drift between capture and import.
pub fn canonical_header_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut capitalize_next = true;

    for c in name.chars() {
        if c == '-' {
            capitalize_next = true;
            result.push(c);
        } else if capitalize_next {
            result.extend(c.to_uppercase());
            capitalize_next = false;
        } else {
            result.extend(c.to_lowercase());
        }
    }

    result
}

/// Sniffs a MIME type from the leading bytes of a body.
///
/// Used to decide whether an exported response body can be embedded in JSON
/// as plain text or has to be base64-encoded. Only the signatures that
/// matter for that decision are recognized; everything that is not valid
/// UTF-8 text falls back to `application/octet-stream`.
pub fn detect_mime_type(body: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x1f\x8b", "application/x-gzip"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
    ];

    for (signature, mime_type) in SIGNATURES {
        if body.starts_with(signature) {
            return mime_type;
        }
    }

    let trimmed = trim_ascii_whitespace_start(body);
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if starts_with_ignore_ascii_case(trimmed, b"<!DOCTYPE html")
        || starts_with_ignore_ascii_case(trimmed, b"<html")
    {
        return "text/html; charset=utf-8";
    }

    match std::str::from_utf8(body) {
        Ok(text) if !text.chars().any(is_binary_char) => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn trim_ascii_whitespace_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn starts_with_ignore_ascii_case(bytes: &[u8], prefix: &[u8]) -> bool {
    bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn is_binary_char(c: char) -> bool {
    c.is_control() && c != '\t' && c != '\n' && c != '\r'
}
