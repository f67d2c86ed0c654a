//! Stable digests of caller parameters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

const ABSENT_DOMAIN: &[u8] = b"cask:params:none";
const PRESENT_DOMAIN: &[u8] = b"cask:params:some:";

/// A SHA-256 digest of a canonicalised JSON value.
///
/// Two structurally equal values produce the same fingerprint regardless of
/// object key order. Absent parameters have their own digest, distinct from
/// every concrete value including `null`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint optional caller parameters.
    pub fn of(params: Option<&Value>) -> Self {
        let mut hasher = Sha256::new();
        match params {
            None => hasher.update(ABSENT_DOMAIN),
            Some(value) => {
                let mut canonical = Vec::with_capacity(64);
                write_canonical(value, &mut canonical);
                hasher.update(PRESENT_DOMAIN);
                hasher.update(&canonical);
            }
        }
        Self(hasher.finalize().into())
    }

    /// Fingerprint any serializable value.
    pub fn of_serializable<T: Serialize + ?Sized>(value: &T) -> crate::Result<Self> {
        let value = serde_json::to_value(value)?;
        Ok(Self::of(Some(&value)))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Lookup key of the keyed reuse cache: a params fingerprint plus the caller's key.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct KeyedId {
    pub fingerprint: Fingerprint,
    pub key: String,
}

impl KeyedId {
    pub fn new(fingerprint: Fingerprint, key: impl Into<String>) -> Self {
        Self {
            fingerprint,
            key: key.into(),
        }
    }
}

impl fmt::Display for KeyedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.fingerprint.short(), self.key)
    }
}

/// Write a canonical encoding: objects with sorted keys, no whitespace.
fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    // Serializing a str into JSON cannot fail.
    let escaped = serde_json::to_string(s).unwrap_or_default();
    out.extend_from_slice(escaped.as_bytes());
}
