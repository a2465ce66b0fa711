//! Key material and the signature scheme used to attest to bridge messages.
//!
//! Every attestation is an EIP-191 personal-message signature over the keccak256 digest of the
//! message payload, which is what the destination gateway contract recovers signers from.

use std::fmt;

use alloy::{
    primitives::{Address, B256, Bytes, eip191_hash_message, keccak256},
    signers::local::PrivateKeySigner,
};
use anyhow::{Result, anyhow};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, de};
use sha3::{Digest, Keccak256};

/// Length of an encoded `r ‖ s ‖ v` signature.
pub const SIGNATURE_LENGTH: usize = 65;

/// The secret key type used as the basis of all cryptography in the node.
/// The node's EVM address, its transaction signer and its libp2p identity are all derived from this.
#[derive(Clone)]
pub struct SecretKey {
    bytes: [u8; 32],
    signing_key: SigningKey,
}

impl SecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<SecretKey> {
        let bytes: [u8; 32] = bytes.try_into()?;

        if bytes == [0; 32] {
            return Err(anyhow!("bytes are all zero"));
        }
        let signing_key = SigningKey::from_bytes(&bytes.into())
            .map_err(|e| anyhow!("invalid secp256k1 secret key: {e}"))?;

        Ok(SecretKey { bytes, signing_key })
    }

    pub fn from_hex(s: &str) -> Result<SecretKey> {
        let bytes_vec = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_bytes(&bytes_vec)
    }

    /// The EVM address controlled by this key.
    pub fn address(&self) -> Address {
        address_of(self.signing_key.verifying_key())
    }

    pub fn to_signer(&self) -> PrivateKeySigner {
        PrivateKeySigner::from_signing_key(self.signing_key.clone())
    }

    pub fn to_libp2p_keypair(&self) -> libp2p::identity::Keypair {
        let keypair: libp2p::identity::ed25519::Keypair = libp2p::identity::ed25519::SecretKey::try_from_bytes(self.bytes)
            .expect("`SecretKey::from_bytes` returns an `Err` only when the length is not 32, we know the length is 32")
            .into();
        keypair.into()
    }

    /// Signs the canonical digest of `payload`.
    pub fn sign_payload(&self, payload: &[u8]) -> Result<Bytes> {
        self.sign_digest(payload_digest(payload))
    }

    /// Produces an EIP-191 signature over a 32-byte digest, encoded as `r ‖ s ‖ v` with `v` in {27, 28}.
    pub fn sign_digest(&self, digest: B256) -> Result<Bytes> {
        let prehash = eip191_hash_message(digest);
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(prehash.as_slice())
            .map_err(|e| anyhow!("failed to sign digest: {e}"))?;

        let mut encoded = Vec::with_capacity(SIGNATURE_LENGTH);
        encoded.extend_from_slice(&signature.to_bytes());
        encoded.push(27 + recovery_id.to_byte());
        Ok(encoded.into())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String>::deserialize(deserializer)?;
        SecretKey::from_hex(&s).map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str("<redacted>"), &"a hex secret key")
        })
    }
}

/// The canonical digest of a bridge payload.
pub fn payload_digest(payload: &[u8]) -> B256 {
    keccak256(payload)
}

/// Digest signed when confirming a penalty accusation against `accused` for one transaction.
pub fn penalty_digest(accused: Address, transaction_hash: B256) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(accused.as_slice());
    hasher.update(transaction_hash.as_slice());
    B256::from_slice(&hasher.finalize())
}

/// Recovers the address that signed the canonical digest of `payload`.
pub fn recover_signer(payload: &[u8], signature: &[u8]) -> Result<Address> {
    recover_digest_signer(payload_digest(payload), signature)
}

pub fn recover_digest_signer(digest: B256, signature: &[u8]) -> Result<Address> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(anyhow!(
            "signature must be {SIGNATURE_LENGTH} bytes, got {}",
            signature.len()
        ));
    }
    let v = signature[64];
    let recovery_id = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })
        .ok_or_else(|| anyhow!("invalid recovery id {v}"))?;
    let signature = EcdsaSignature::from_slice(&signature[..64])?;

    let prehash = eip191_hash_message(digest);
    let key = VerifyingKey::recover_from_prehash(prehash.as_slice(), &signature, recovery_id)?;
    Ok(address_of(&key))
}

fn address_of(key: &VerifyingKey) -> Address {
    // Remove the first byte before hashing - The first byte specifies the encoding tag.
    let encoded = key.to_encoded_point(false);
    Address::from_slice(&Keccak256::digest(&encoded.as_bytes()[1..])[12..32])
}
