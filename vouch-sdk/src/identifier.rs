//! Typed identifiers and trust-pathable predicates.
//!
//! An identifier is a `(predicate, value)` pair: `email:alice@example.com`,
//! `keyID:3KbF...`, `nickname:Alice`. Predicates name the semantic type; a
//! fixed subset of them — the trust-pathable predicates — marks identifier
//! kinds that are allowed to act as intermediate hops in trust paths.
//! Free-text predicates like `name` or `nickname` can receive trust edges
//! but never forward them.

use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Predicates whose identifiers may serve as intermediate trust-path hops.
pub const TRUST_PATHABLE_PREDICATES: &[&str] = &[
    "mbox",
    "email",
    "account",
    "url",
    "tel",
    "keyID",
    "base58pubkey",
    "bitcoin_address",
    "bitcoin",
    "identifi_msg",
    "twitter",
    "facebook",
    "google_oauth2",
];

/// A typed identifier: `(predicate, value)`.
///
/// Ordering is byte-lexicographic over `(predicate, value)`, which is also
/// the canonical sort order for author/recipient lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier {
    pub predicate: String,
    pub value: String,
}

impl Identifier {
    pub fn new(predicate: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            value: value.into(),
        }
    }

    /// Whether this identifier's predicate is in the default trust-pathable set.
    pub fn is_trust_pathable(&self) -> bool {
        TRUST_PATHABLE_PREDICATES.contains(&self.predicate.as_str())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.predicate, self.value)
    }
}

// Wire form is a two-element JSON array: ["email","alice@example.com"].

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.predicate)?;
        seq.serialize_element(&self.value)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = Identifier;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [predicate, value] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Identifier, A::Error> {
                let predicate: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let value: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                if seq.next_element::<serde_json::Value>()?.is_some() {
                    return Err(de::Error::invalid_length(3, &self));
                }
                Ok(Identifier { predicate, value })
            }
        }

        deserializer.deserialize_seq(IdVisitor)
    }
}

// ── Path strings ───────────────────────────────────────────────────────
//
// The graph queries track visited vertices as a single text column of
// `predicate:value:` segments. Literal colons inside components are doubled
// so that a single `:` is always a separator.

/// Escape one path component (`:` → `::`).
pub fn encode_path_component(s: &str) -> String {
    s.replace(':', "::")
}

/// One `predicate:value:` segment of a path string, escaped.
pub fn path_segment(id: &Identifier) -> String {
    format!(
        "{}:{}:",
        encode_path_component(&id.predicate),
        encode_path_component(&id.value)
    )
}

/// Split an escaped path string back into identifiers.
///
/// Inverse of concatenated [`path_segment`] output; trailing separator is
/// accepted. Odd component counts lose the dangling component, which cannot
/// occur for strings we produced ourselves.
pub fn split_path(path: &str) -> Vec<Identifier> {
    let mut components: Vec<String> = Vec::new();
    let mut current = String::new();
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' {
            if i + 1 < bytes.len() && bytes[i + 1] == b':' {
                current.push(':');
                i += 2;
            } else {
                components.push(std::mem::take(&mut current));
                i += 1;
            }
        } else {
            // components are produced from valid UTF-8, multi-byte chars
            // never contain b':' so byte-wise scanning is safe
            let ch_len = utf8_len(bytes[i]);
            current.push_str(&path[i..i + ch_len]);
            i += ch_len;
        }
    }
    if !current.is_empty() {
        components.push(current);
    }

    components
        .chunks_exact(2)
        .map(|pair| Identifier::new(pair[0].clone(), pair[1].clone()))
        .collect()
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >> 5 == 0b110 => 2,
        b if b >> 4 == 0b1110 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_ordering() {
        let a = Identifier::new("email", "alice@example.com");
        let b = Identifier::new("email", "bob@example.com");
        let n = Identifier::new("nickname", "Al");
        assert_eq!(a.to_string(), "email:alice@example.com");
        assert!(a < b);
        assert!(b < n); // predicate compares first
    }

    #[test]
    fn trust_pathable_set() {
        assert!(Identifier::new("email", "a@b").is_trust_pathable());
        assert!(Identifier::new("keyID", "x").is_trust_pathable());
        assert!(!Identifier::new("nickname", "Al").is_trust_pathable());
        assert!(!Identifier::new("name", "Alice Smith").is_trust_pathable());
    }

    #[test]
    fn json_roundtrip_as_pair() {
        let id = Identifier::new("email", "alice@example.com");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"["email","alice@example.com"]"#);
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn json_rejects_wrong_arity() {
        assert!(serde_json::from_str::<Identifier>(r#"["email"]"#).is_err());
        assert!(serde_json::from_str::<Identifier>(r#"["a","b","c"]"#).is_err());
    }

    #[test]
    fn path_roundtrip() {
        let ids = vec![
            Identifier::new("url", "http://example.com/alice"),
            Identifier::new("email", "bob@example.com"),
        ];
        let path: String = ids.iter().map(path_segment).collect();
        assert_eq!(path, "url:http:://example.com/alice:email:bob@example.com:");
        let back = split_path(&path);
        assert_eq!(back, ids);
    }

    #[test]
    fn path_escapes_colons() {
        let id = Identifier::new("mbox", "mailto:carl@example.com");
        let seg = path_segment(&id);
        assert_eq!(seg, "mbox:mailto::carl@example.com:");
        assert_eq!(split_path(&seg), vec![id]);
    }
}
