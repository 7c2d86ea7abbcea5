// We define in our crate:
use crate::Error;
use ed25519_dalek::PublicKey;
use ed25519_dalek::Signature;
use std::borrow::Cow;
use std::convert::TryFrom;

pub use hex_buffer_serde::Hex;

// a single-purpose type for use in `#[serde(with)]`
pub enum EdPublicKeyHex {}

impl Hex<PublicKey> for EdPublicKeyHex {
    type Error = Error;

    fn create_bytes(public_key: &PublicKey) -> Cow<[u8]> {
        public_key.as_ref().into()
    }

    fn from_bytes(bytes: &[u8]) -> Result<PublicKey, Error> {
        PublicKey::from_bytes(bytes).map_err(|_| Error::InvalidSignature)
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum EdSignatureHex {}

impl Hex<Signature> for EdSignatureHex {
    type Error = Error;

    fn create_bytes(sig: &Signature) -> Cow<[u8]> {
        let bytes = sig.to_bytes().to_vec();
        Cow::from(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Signature, Error> {
        Signature::try_from(bytes).map_err(|_| Error::InvalidSignature)
    }
}

// a single-purpose type for use in `#[serde(with)]` - gossip envelope nonces
pub enum Bytes16Hex {}

impl Hex<[u8; 16]> for Bytes16Hex {
    type Error = Error;

    fn create_bytes(bytes: &[u8; 16]) -> Cow<[u8]> {
        bytes.as_ref().into()
    }

    fn from_bytes(bytes: &[u8]) -> Result<[u8; 16], Error> {
        <[u8; 16]>::try_from(bytes)
            .map_err(|_| Error::ValidationError("expected a 16-byte hex value".to_string()))
    }
}

/// Base64url (unpadded) serde for raw token bytes at service boundaries.
pub mod base64url {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode_config(bytes, base64::URL_SAFE_NO_PAD))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::decode_config(&s, base64::URL_SAFE_NO_PAD).map_err(de::Error::custom)
    }
}
