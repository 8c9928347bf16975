//! Cache signatures.
//!
//! A signature is a SHA-256 digest over every parameter that affects a
//! remote result. List-valued fields are normalized (trimmed, lowercased,
//! sorted, deduplicated) so two requests that differ only in parameter
//! order produce the same signature.

use std::fmt;

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incrementally builds a [`Signature`] from named fields.
///
/// Each field is written as `name=value` followed by a NUL separator, so
/// adjacent fields cannot run together.
pub struct SignatureBuilder {
    hasher: Sha256,
}

impl SignatureBuilder {
    /// Start a signature for a given kind of request (e.g. `"metrics"`).
    pub fn new(kind: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.write("kind", kind);
        builder
    }

    fn write(&mut self, name: &str, value: &str) {
        self.hasher.update(name.as_bytes());
        self.hasher.update(b"=");
        self.hasher.update(value.as_bytes());
        self.hasher.update([0u8]);
    }

    /// Case-sensitive scalar field.
    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.write(name, value.trim());
        self
    }

    /// Case-insensitive scalar field.
    pub fn field_ci(mut self, name: &str, value: &str) -> Self {
        self.write(name, &value.trim().to_lowercase());
        self
    }

    /// Optional field; absent and empty are equivalent.
    pub fn opt(self, name: &str, value: Option<&str>) -> Self {
        self.field(name, value.unwrap_or(""))
    }

    /// Order-insensitive, case-insensitive list field.
    pub fn set<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = values
            .into_iter()
            .map(|v| v.as_ref().trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();
        self.write(name, &normalized.join("\u{1f}"));
        self
    }

    pub fn finish(self) -> Signature {
        Signature(hex::encode(self.hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_order_insensitive() {
        let a = SignatureBuilder::new("metrics")
            .set("metrics", ["Percentage CPU", "Disk Read Bytes"])
            .finish();
        let b = SignatureBuilder::new("metrics")
            .set("metrics", ["disk read bytes", "Percentage CPU", "Percentage CPU"])
            .finish();
        assert_eq!(a, b);
    }

    #[test]
    fn kind_and_fields_are_distinguished() {
        let a = SignatureBuilder::new("metrics").field("a", "bc").finish();
        let b = SignatureBuilder::new("metrics").field("ab", "c").finish();
        let c = SignatureBuilder::new("tags").field("a", "bc").finish();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn absent_optional_equals_empty() {
        let a = SignatureBuilder::new("x").opt("filter", None).finish();
        let b = SignatureBuilder::new("x").opt("filter", Some("")).finish();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn case_insensitive_field() {
        let a = SignatureBuilder::new("x").field_ci("id", "/Subscriptions/A").finish();
        let b = SignatureBuilder::new("x").field_ci("id", "/subscriptions/a").finish();
        assert_eq!(a, b);
    }
}
