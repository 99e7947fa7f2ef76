use std::fmt;
use std::str::FromStr;

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest as _, Sha256};

/// A 32-byte SHA-256 digest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn hash(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data.as_ref());
        Self(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Digest {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidDigest)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidDigest)?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed digest")]
    InvalidDigest,

    #[error("malformed public key")]
    InvalidPublicKey,

    #[error("malformed private key")]
    InvalidPrivateKey,

    #[error("malformed signature")]
    InvalidSignature,

    #[error("signature recovery failed")]
    RecoveryFailed,
}

/// Compressed secp256k1 public key (33 bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; 33]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 33]) -> Result<Self, CryptoError> {
        VerifyingKey::from_sec1_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    pub fn verify(&self, digest: &Digest, signature: &Signature) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_sec1_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = k256::ecdsa::Signature::from_slice(&signature.0[..64])
            .map_err(|_| CryptoError::InvalidSignature)?;
        key.verify_prehash(digest.as_bytes(), &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PAL{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("PAL").ok_or(CryptoError::InvalidPublicKey)?;
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        let bytes: [u8; 33] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(bytes)
    }
}

/// secp256k1 signing key.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        SigningKey::from_slice(bytes).map(Self).map_err(|_| CryptoError::InvalidPrivateKey)
    }

    pub fn random() -> Self {
        Self(SigningKey::random(&mut rand::thread_rng()))
    }

    /// Derives a key deterministically from a seed string. Used for throwaway
    /// development chains only.
    pub fn from_seed(seed: &str) -> Self {
        let mut digest = Digest::hash(seed.as_bytes());
        loop {
            if let Ok(key) = SigningKey::from_slice(digest.as_bytes()) {
                return Self(key);
            }
            digest = Digest::hash(digest.as_bytes());
        }
    }

    /// Canonical hex encoding, as accepted by [`FromStr`]. Handle with care.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        let point = self.0.verifying_key().to_encoded_point(true);
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(point.as_bytes());
        PublicKey(bytes)
    }

    /// Signs a 32-byte digest, producing a recoverable signature.
    pub fn sign(&self, digest: &Digest) -> Result<Signature, CryptoError> {
        let (sig, recovery_id) = self
            .0
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|_| CryptoError::InvalidDigest)?;
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(sig.to_bytes().as_slice());
        bytes[64] = recovery_id.to_byte();
        Ok(Signature(bytes))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never leak key material through logs
        write!(f, "PrivateKey(****)")
    }
}

impl FromStr for PrivateKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPrivateKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPrivateKey)?;
        Self::from_bytes(&bytes)
    }
}

/// Recoverable secp256k1 signature: 64 bytes `r || s` plus one recovery byte.
///
/// The all-zero value is reserved as a sentinel for "no signature" and is what
/// a remote signer returns after shutdown.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 65]);

impl Signature {
    pub const ZERO: Self = Self([0u8; 65]);

    pub const fn from_bytes(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Recovers the public key that produced this signature over `digest`.
    pub fn recover(&self, digest: &Digest) -> Result<PublicKey, CryptoError> {
        let sig = k256::ecdsa::Signature::from_slice(&self.0[..64])
            .map_err(|_| CryptoError::InvalidSignature)?;
        let recovery_id =
            RecoveryId::from_byte(self.0[64]).ok_or(CryptoError::InvalidSignature)?;
        let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &sig, recovery_id)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        let point = key.to_encoded_point(true);
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(point.as_bytes());
        Ok(PublicKey(bytes))
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

impl FromStr for Signature {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("SIG").ok_or(CryptoError::InvalidSignature)?;
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidSignature)?;
        let bytes: [u8; 65] = bytes.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_round_trip() {
        let key = PrivateKey::random();
        let digest = Digest::hash(b"payload");

        let sig = key.sign(&digest).unwrap();
        assert_eq!(sig.recover(&digest).unwrap(), key.public_key());
        key.public_key().verify(&digest, &sig).unwrap();
    }

    #[test]
    fn recovering_with_wrong_digest_yields_different_key() {
        let key = PrivateKey::random();
        let sig = key.sign(&Digest::hash(b"a")).unwrap();

        let recovered = sig.recover(&Digest::hash(b"b"));
        if let Ok(other) = recovered {
            assert_ne!(other, key.public_key());
        }
    }

    #[test]
    fn key_string_round_trip() {
        let key = PrivateKey::from_seed("nathan");
        let public = key.public_key();
        let parsed: PublicKey = public.to_string().parse().unwrap();
        assert_eq!(parsed, public);
    }

    #[test]
    fn zero_signature_is_sentinel() {
        assert!(Signature::ZERO.is_zero());
        assert!(Signature::ZERO.recover(&Digest::hash(b"x")).is_err());
    }
}
