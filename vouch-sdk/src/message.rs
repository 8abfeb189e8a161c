//! The signed attestation message.
//!
//! A message is an immutable record: a canonical-JSON `signedData` payload
//! (timestamp, author identifiers, recipient identifiers, type, optional
//! comment and rating bounds) plus an ed25519 signature over exactly those
//! canonical bytes. The message hash is the base64 SHA-256 of the canonical
//! `signedData`, so two messages with equal payloads are the same message.
//!
//! Parsing is strict: input must round-trip byte-for-byte through the
//! canonicalizer and carry its author/recipient lists pre-sorted. New
//! messages built locally are canonicalized (and their lists sorted) before
//! hashing, so locally-authored and wire-received messages hash identically.

use base64::Engine;
use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::canonical::{canonicalize, canonicalize_value, sha256_b64};
use crate::error::CodecError;
use crate::identifier::Identifier;

/// Message type for connection confirmations.
pub const TYPE_CONFIRM_CONNECTION: &str = "confirm_connection";
/// Message type for connection refutations.
pub const TYPE_REFUTE_CONNECTION: &str = "refute_connection";
/// Message type for ratings.
pub const TYPE_RATING: &str = "rating";

/// Whether a message type is one of the connection link types. These never
/// participate in `IsLatest` deduplication or interval replacement.
pub fn is_connection_type(msg_type: &str) -> bool {
    msg_type == TYPE_CONFIRM_CONNECTION || msg_type == TYPE_REFUTE_CONNECTION
}

/// The signed payload of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SignedData {
    pub timestamp: i64,
    pub author: Vec<Identifier>,
    pub recipient: Vec<Identifier>,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i64>,
    #[serde(rename = "minRating", default, skip_serializing_if = "Option::is_none")]
    pub min_rating: Option<i64>,
    #[serde(rename = "maxRating", default, skip_serializing_if = "Option::is_none")]
    pub max_rating: Option<i64>,
}

/// Signature envelope: signer public key (base58) and signature (base64).
/// Serializes to `{}` while unsigned.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MessageSignature {
    #[serde(rename = "pubKey", default, skip_serializing_if = "String::is_empty")]
    pub pub_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl MessageSignature {
    pub fn is_empty(&self) -> bool {
        self.pub_key.is_empty() && self.signature.is_empty()
    }
}

/// A signed message plus its store-side state.
///
/// `published`, `priority`, and `is_latest` are not part of the signed
/// payload; the store mutates them after ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub signed_data: SignedData,
    pub signature: MessageSignature,
    hash: String,
    pub published: bool,
    pub priority: i64,
    pub is_latest: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    #[serde(rename = "signedData")]
    signed_data: SignedData,
    signature: MessageSignature,
}

impl Message {
    /// Build a message from a locally-constructed payload. Author and
    /// recipient lists are sorted into canonical order before hashing.
    pub fn new(mut signed_data: SignedData) -> Self {
        signed_data.author.sort();
        signed_data.recipient.sort();
        let hash = hash_signed_data(&signed_data);
        Self {
            signed_data,
            signature: MessageSignature::default(),
            hash,
            published: false,
            priority: 0,
            is_latest: false,
        }
    }

    /// Build a rating message.
    pub fn new_rating(
        author: Identifier,
        recipient: Identifier,
        rating: i64,
        comment: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self::new(SignedData {
            timestamp,
            author: vec![author],
            recipient: vec![recipient],
            msg_type: TYPE_RATING.to_string(),
            comment,
            rating: Some(rating),
            min_rating: Some(-10),
            max_rating: Some(10),
        })
    }

    /// Build a confirm_connection or refute_connection message linking
    /// `id1` and `id2`, attested by `author`.
    pub fn connection(
        author: Identifier,
        id1: Identifier,
        id2: Identifier,
        confirm: bool,
        timestamp: i64,
    ) -> Self {
        let msg_type = if confirm {
            TYPE_CONFIRM_CONNECTION
        } else {
            TYPE_REFUTE_CONNECTION
        };
        Self::new(SignedData {
            timestamp,
            author: vec![author],
            recipient: vec![id1, id2],
            msg_type: msg_type.to_string(),
            comment: None,
            rating: None,
            min_rating: None,
            max_rating: None,
        })
    }

    /// Strict parse from canonical JSON.
    ///
    /// Rejects bytes that do not re-serialize to themselves, payloads with
    /// missing fields, and unsorted author/recipient lists.
    pub fn from_canonical_json(input: &str) -> Result<Self, CodecError> {
        let value: serde_json::Value =
            serde_json::from_str(input).map_err(|_| CodecError::InvalidFormat)?;
        if canonicalize_value(&value) != input {
            return Err(CodecError::InvalidFormat);
        }

        let obj = value.as_object().ok_or(CodecError::InvalidFormat)?;
        if !obj.contains_key("signedData") {
            return Err(CodecError::MissingField("signedData"));
        }
        if !obj.contains_key("signature") {
            return Err(CodecError::MissingField("signature"));
        }
        let sd = obj["signedData"]
            .as_object()
            .ok_or(CodecError::MissingField("signedData"))?;
        for field in ["timestamp", "author", "recipient", "type"] {
            if !sd.contains_key(field) {
                return Err(CodecError::MissingField(match field {
                    "timestamp" => "timestamp",
                    "author" => "author",
                    "recipient" => "recipient",
                    _ => "type",
                }));
            }
        }

        let envelope: Envelope =
            serde_json::from_value(value).map_err(|_| CodecError::InvalidFormat)?;
        let signed_data = envelope.signed_data;

        if signed_data.author.is_empty() {
            return Err(CodecError::MissingField("author"));
        }
        if signed_data.recipient.is_empty() {
            return Err(CodecError::MissingField("recipient"));
        }
        if !is_sorted(&signed_data.author) || !is_sorted(&signed_data.recipient) {
            return Err(CodecError::UnsortedLists);
        }

        let hash = hash_signed_data(&signed_data);
        Ok(Self {
            signed_data,
            signature: envelope.signature,
            hash,
            published: false,
            priority: 0,
            is_latest: false,
        })
    }

    /// Canonical JSON of the full message (signature + signedData).
    pub fn to_canonical_json(&self) -> String {
        let envelope = serde_json::json!({
            "signedData": self.signed_data,
            "signature": self.signature,
        });
        canonicalize_value(&envelope)
    }

    /// Canonical bytes of the signed payload — the signing/hashing input.
    pub fn signed_bytes(&self) -> Vec<u8> {
        canonicalize(&self.signed_data)
            .unwrap_or_default()
            .into_bytes()
    }

    /// base64(SHA-256(canonical signedData)).
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn timestamp(&self) -> i64 {
        self.signed_data.timestamp
    }

    pub fn msg_type(&self) -> &str {
        &self.signed_data.msg_type
    }

    pub fn authors(&self) -> &[Identifier] {
        &self.signed_data.author
    }

    pub fn recipients(&self) -> &[Identifier] {
        &self.signed_data.recipient
    }

    pub fn comment(&self) -> Option<&str> {
        self.signed_data.comment.as_deref()
    }

    pub fn rating(&self) -> i64 {
        self.signed_data.rating.unwrap_or(0)
    }

    pub fn min_rating(&self) -> i64 {
        self.signed_data.min_rating.unwrap_or(0)
    }

    pub fn max_rating(&self) -> i64 {
        self.signed_data.max_rating.unwrap_or(0)
    }

    /// A message is positive when its rating exceeds the midpoint of its
    /// rating scale (integer midpoint, matching stored arithmetic).
    pub fn is_positive(&self) -> bool {
        self.rating() > (self.min_rating() + self.max_rating()) / 2
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Sign the canonical payload bytes with an ed25519 key.
    pub fn sign(&mut self, key: &ed25519_dalek::SigningKey) {
        let sig = key.sign(&self.signed_bytes());
        self.signature = MessageSignature {
            pub_key: bs58::encode(key.verifying_key().to_bytes()).into_string(),
            signature: base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
        };
    }

    /// Verify the signature over the canonical payload bytes.
    /// Unsigned or undecodable signatures verify as false.
    pub fn verify(&self) -> bool {
        if self.signature.is_empty() {
            return false;
        }
        let Ok(pub_bytes) = bs58::decode(&self.signature.pub_key).into_vec() else {
            return false;
        };
        let Ok(pub_bytes) = <[u8; 32]>::try_from(pub_bytes) else {
            return false;
        };
        let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(&pub_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = base64::engine::general_purpose::STANDARD
            .decode(&self.signature.signature)
        else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(&sig_bytes) else {
            return false;
        };
        verifying_key.verify(&self.signed_bytes(), &sig).is_ok()
    }
}

fn hash_signed_data(signed_data: &SignedData) -> String {
    let canonical = canonicalize(signed_data).unwrap_or_default();
    sha256_b64(canonical.as_bytes())
}

fn is_sorted(ids: &[Identifier]) -> bool {
    ids.windows(2).all(|w| w[0] <= w[1])
}
