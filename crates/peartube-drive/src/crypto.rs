//! Key material and hashing helpers for the log stack.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use peartube_core::{ChannelKey, CoreError, Result};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separator for block signatures.
const BLOCK_CONTEXT: &str = "peartube/block/v1";
/// Domain separator for discovery keys.
const DISCOVERY_CONTEXT: &str = "peartube/discovery/v1";

/// Owner key material for one drive: the metadata log keypair and the paired
/// blob log keypair. Serialised into the node store for the local identity
/// and created channels.
#[derive(Clone, Serialize, Deserialize)]
pub struct DriveKeys {
    /// Metadata log secret key, hex encoded.
    pub meta_secret: String,
    /// Blob log secret key, hex encoded.
    pub blobs_secret: String,
}

impl DriveKeys {
    /// Generate fresh key material for a new owner drive.
    #[must_use]
    pub fn generate() -> Self {
        let meta = SigningKey::generate(&mut OsRng);
        let blobs = SigningKey::generate(&mut OsRng);
        Self {
            meta_secret: hex::encode(meta.to_bytes()),
            blobs_secret: hex::encode(blobs.to_bytes()),
        }
    }

    /// The metadata signing key.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored hex is malformed.
    pub fn meta_signing_key(&self) -> Result<SigningKey> {
        signing_key_from_hex(&self.meta_secret)
    }

    /// The blob-log signing key.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored hex is malformed.
    pub fn blobs_signing_key(&self) -> Result<SigningKey> {
        signing_key_from_hex(&self.blobs_secret)
    }

    /// The channel key named by this key material.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored hex is malformed.
    pub fn channel_key(&self) -> Result<ChannelKey> {
        let signing = self.meta_signing_key()?;
        Ok(ChannelKey::from_bytes(signing.verifying_key().to_bytes()))
    }
}

impl std::fmt::Debug for DriveKeys {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("DriveKeys(redacted)")
    }
}

fn signing_key_from_hex(value: &str) -> Result<SigningKey> {
    let mut bytes = [0_u8; 32];
    hex::decode_to_slice(value, &mut bytes)
        .map_err(|_| CoreError::internal("stored secret key is not 32 hex-encoded bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// One-way hash of a log public key, safe to announce on the overlay.
#[must_use]
pub fn discovery_key(public_key: &[u8; 32]) -> [u8; 32] {
    blake3::derive_key(DISCOVERY_CONTEXT, public_key)
}

/// Hash a well-known topic name to its 32-byte overlay topic.
///
/// Interop-critical: both sides of the public feed rendezvous on
/// `topic_hash("peartube-public-feed-v1")`, byte for byte.
#[must_use]
pub fn topic_hash(name: &str) -> [u8; 32] {
    *blake3::hash(name.as_bytes()).as_bytes()
}

/// Digest a block signature covers: domain-separated over the index and the
/// payload.
fn block_message(index: u64, payload: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(BLOCK_CONTEXT);
    hasher.update(&index.to_le_bytes());
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

/// Sign one log block.
#[must_use]
pub(crate) fn sign_block(key: &SigningKey, index: u64, payload: &[u8]) -> [u8; 64] {
    key.sign(&block_message(index, payload)).to_bytes()
}

/// Verify one log block against the log's public key.
pub(crate) fn verify_block(
    key: &VerifyingKey,
    index: u64,
    payload: &[u8],
    signature: &[u8; 64],
) -> Result<()> {
    let signature = Signature::from_bytes(signature);
    key.verify(&block_message(index, payload), &signature)
        .map_err(|_| CoreError::BadSignature { index })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_signatures_verify_and_reject_tampering() {
        let keys = DriveKeys::generate();
        let signing = keys.meta_signing_key().expect("signing key");
        let verifying = signing.verifying_key();

        let signature = sign_block(&signing, 7, b"payload");
        verify_block(&verifying, 7, b"payload", &signature).expect("valid block verifies");

        assert!(verify_block(&verifying, 8, b"payload", &signature).is_err());
        assert!(verify_block(&verifying, 7, b"tampered", &signature).is_err());
    }

    #[test]
    fn discovery_key_is_stable_and_distinct() {
        let key = [0x11_u8; 32];
        assert_eq!(discovery_key(&key), discovery_key(&key));
        assert_ne!(discovery_key(&key), key);
    }

    #[test]
    fn feed_topic_is_the_hash_of_the_literal_name() {
        let topic = topic_hash("peartube-public-feed-v1");
        assert_eq!(
            topic,
            *blake3::hash(b"peartube-public-feed-v1").as_bytes()
        );
    }

    #[test]
    fn drive_keys_round_trip_through_hex() {
        let keys = DriveKeys::generate();
        let channel = keys.channel_key().expect("channel key");
        let again = keys.channel_key().expect("channel key");
        assert_eq!(channel, again);
        assert_ne!(keys.meta_secret, keys.blobs_secret);
    }
}
