//! Utility functions and helpers
//!
//! Cryptographic primitives (hashing, ECDSA signing) and the bincode
//! encoding used for deterministic hash preimages.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, hex_decode,
    hex_encode, new_key_pair, public_key_from_pkcs8, sha256_digest,
};

pub use serialization::{deserialize, serialize};
