//! Protocol layer for the vouch web-of-trust store.
//!
//! A vouch network is a corpus of signed attestations ("messages") linking
//! identifiers to one another: ratings, reviews, and connection
//! confirmations/refutations. This crate defines the wire-level pieces that
//! both the store and its clients agree on:
//!
//! - [`Identifier`]: typed `(predicate, value)` pairs and the set of
//!   predicates that may appear as intermediate hops in trust paths.
//! - [`Message`]: the canonical-JSON signed message, its SHA-256 hash, and
//!   ed25519 signature creation/verification.
//! - [`keys`]: keypair generation and the base58 encodings used for public
//!   keys, exported secrets, and keyIDs.
//!
//! Canonical form is strict: a message parsed from bytes must re-serialize
//! to exactly those bytes, otherwise it is rejected. This is what makes
//! hashes and signatures portable between implementations.

pub mod canonical;
pub mod error;
pub mod identifier;
pub mod keys;
pub mod message;

pub use error::CodecError;
pub use identifier::Identifier;
pub use message::{Message, MessageSignature, SignedData};
