//! Schnorr signing keys and account-address derivation on secp256k1.

use crate::types::address::{ADDRESS_SIZE, Address};
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use k256::schnorr::signature::{Error as SignatureError, Signer, Verifier};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use sha3::{Digest, Sha3_256};

/// Domain tag mixed into address derivation, keeping address preimages
/// disjoint from every other digest computed over key material.
const ADDRESS_TAG: &[u8] = b"ADDR";

/// Derives the account address owned by a verifying key: the first
/// [`ADDRESS_SIZE`] bytes of SHA3-256 over the tagged x-only key bytes.
fn derive_address(key: &VerifyingKey) -> Address {
    let digest: [u8; 32] = Sha3_256::new()
        .chain_update(ADDRESS_TAG)
        .chain_update(key.to_bytes())
        .finalize()
        .into();
    Address::from_slice(&digest[..ADDRESS_SIZE]).expect("20-byte prefix of a 32-byte digest")
}

/// Secret signing key.
///
/// Lives only in memory; the engine never writes key material to disk or
/// puts it on the wire.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

/// Verifying key paired with the account address it owns.
///
/// The pair is `Copy`: every call site that holds the key wants the address
/// moments later (transaction senders, mining identities), so the address is
/// derived once and carried on the stack instead of recomputed per use.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub key: VerifyingKey,
    pub address: Address,
}

impl PrivateKey {
    /// Generates a fresh key from OS entropy.
    pub fn new() -> Self {
        let mut rng = OsRng;
        Self {
            key: SigningKey::random(&mut rng),
        }
    }

    /// Restores a key from a raw 32-byte scalar.
    ///
    /// Returns `None` when the bytes fall outside the curve order.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_bytes(bytes).ok().map(|key| Self { key })
    }

    /// Returns the verifying half together with its derived address.
    pub fn public_key(&self) -> PublicKey {
        let key = *self.key.verifying_key();
        PublicKey {
            key,
            address: derive_address(&key),
        }
    }

    /// Signs arbitrary data, producing a Schnorr signature.
    pub fn sign(&self, data: &[u8]) -> SerializableSignature {
        SerializableSignature(self.key.sign(data))
    }

    /// Fallible signing for callers that must report failure instead of
    /// panicking, such as the signed remote-mining requests.
    pub fn try_sign(&self, data: &[u8]) -> Result<SerializableSignature, SignatureError> {
        Ok(SerializableSignature(self.key.try_sign(data)?))
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicKey {
    /// Rebuilds a public key, re-deriving its address, from x-only key
    /// bytes. Returns `None` when the bytes are not a valid curve point.
    pub fn from_key_bytes(bytes: &[u8; 32]) -> Option<Self> {
        let key = VerifyingKey::from_bytes(bytes).ok()?;
        Some(PublicKey {
            key,
            address: derive_address(&key),
        })
    }

    /// Verifies a Schnorr signature against the given data.
    ///
    /// Returns `true` if the signature is valid, `false` otherwise.
    pub fn verify(&self, data: &[u8], signature: SerializableSignature) -> bool {
        self.key.verify(data, &signature.0).is_ok()
    }

    /// Returns the 32-byte x-only serialization of the verifying key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes().into()
    }
}

impl Encode for PublicKey {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&self.key.to_bytes());
    }
}

impl Decode for PublicKey {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let key_bytes = <[u8; 32]>::decode(input)?;
        PublicKey::from_key_bytes(&key_bytes).ok_or(DecodeError::InvalidValue)
    }
}

/// Wrapper around `Signature` implementing the crate's binary codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializableSignature(pub Signature);

impl SerializableSignature {
    pub fn new(sig: Signature) -> Self {
        SerializableSignature(sig)
    }

    /// Returns the raw 64-byte signature.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl From<Signature> for SerializableSignature {
    fn from(sig: Signature) -> Self {
        SerializableSignature(sig)
    }
}

impl Encode for SerializableSignature {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&self.0.to_bytes());
    }
}

impl Decode for SerializableSignature {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes = <[u8; 64]>::decode(input)?;
        let sig = Signature::try_from(bytes.as_slice()).map_err(|_| DecodeError::InvalidValue)?;
        Ok(SerializableSignature(sig))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let key = PrivateKey::new();
        let public = key.public_key();
        let sig = key.sign(b"payload");
        assert!(public.verify(b"payload", sig));
        assert!(!public.verify(b"tampered", sig));
    }

    #[test]
    fn try_sign_matches_sign() {
        let key = PrivateKey::new();
        let public = key.public_key();
        let sig = key.try_sign(b"payload").expect("signing");
        assert!(public.verify(b"payload", sig));
    }

    #[test]
    fn verify_fails_with_wrong_key() {
        let key1 = PrivateKey::new();
        let key2 = PrivateKey::new();
        let sig = key1.sign(b"data");
        assert!(!key2.public_key().verify(b"data", sig));
    }

    #[test]
    fn address_is_deterministic_per_key() {
        let key = PrivateKey::new();
        assert_eq!(key.public_key().address, key.public_key().address);
        assert_ne!(key.public_key().address, PrivateKey::new().public_key().address);
    }

    #[test]
    fn address_derivation_is_domain_tagged() {
        let key = PrivateKey::new();
        let public = key.public_key();

        // An untagged digest of the key bytes must not collide with the
        // account address.
        let untagged: [u8; 32] = Sha3_256::digest(public.to_bytes()).into();
        assert_ne!(public.address.as_slice(), &untagged[..ADDRESS_SIZE]);
    }

    #[test]
    fn from_bytes_roundtrip() {
        let key = PrivateKey::new();
        let bytes: [u8; 32] = key.key.to_bytes().into();
        let restored = PrivateKey::from_bytes(&bytes).expect("valid scalar");
        assert_eq!(restored.public_key(), key.public_key());
    }

    #[test]
    fn from_key_bytes_rederives_address() {
        let public = PrivateKey::new().public_key();
        let restored = PublicKey::from_key_bytes(&public.to_bytes()).expect("valid point");
        assert_eq!(restored, public);
        assert_eq!(restored.address, public.address);
    }

    #[test]
    fn public_key_encode_decode_roundtrip() {
        let public = PrivateKey::new().public_key();
        let encoded = Encode::to_bytes(&public);
        let decoded = PublicKey::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, public);
        assert_eq!(decoded.address, public.address);
    }

    #[test]
    fn signature_encode_decode_roundtrip() {
        let key = PrivateKey::new();
        let sig = key.sign(b"msg");
        let encoded = Encode::to_bytes(&sig);
        let decoded = SerializableSignature::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, sig);
    }
}
