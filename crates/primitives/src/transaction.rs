use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::crypto::{CryptoError, Digest, PublicKey, Signature};
use crate::time::Timestamp;

/// Transaction identifier (digest of the packed transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(Digest);

impl TxId {
    pub const fn new(digest: Digest) -> Self {
        Self(digest)
    }

    pub const fn as_digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// A transaction with the metadata the production core needs: identity,
/// expiry, signing digest, and the lazily recovered signer keys.
///
/// Key recovery is CPU-bound, so it runs on the producer's worker pool; the
/// result is cached here and trusted for the lifetime of the metadata, which
/// is what lets persisted transactions be replayed across cycles without
/// being re-verified.
#[derive(Debug)]
pub struct TransactionMeta {
    id: TxId,
    expiration: Timestamp,
    signing_digest: Digest,
    signatures: Vec<Signature>,
    recovered_keys: OnceLock<Vec<PublicKey>>,
}

impl TransactionMeta {
    pub fn new(signing_digest: Digest, expiration: Timestamp, signatures: Vec<Signature>) -> Self {
        let mut bytes = Vec::with_capacity(40);
        bytes.extend_from_slice(signing_digest.as_bytes());
        bytes.extend_from_slice(&expiration.as_micros().to_be_bytes());
        let id = TxId::new(Digest::hash(&bytes));

        Self { id, expiration, signing_digest, signatures, recovered_keys: OnceLock::new() }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn expiration(&self) -> Timestamp {
        self.expiration
    }

    pub fn signing_digest(&self) -> &Digest {
        &self.signing_digest
    }

    /// Recovers the public keys that signed this transaction, caching the
    /// result. Signatures that fail recovery contribute no key; authority
    /// checks downstream will reject the transaction deterministically.
    pub fn recover_keys(&self) -> &[PublicKey] {
        self.recovered_keys.get_or_init(|| {
            self.signatures
                .iter()
                .filter_map(|sig| sig.recover(&self.signing_digest).ok())
                .collect()
        })
    }

    /// Whether key recovery has already run for this transaction.
    pub fn keys_recovered(&self) -> bool {
        self.recovered_keys.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    #[test]
    fn recovered_keys_are_cached() {
        let key = PrivateKey::random();
        let digest = Digest::hash(b"transfer");
        let sig = key.sign(&digest).unwrap();

        let tx = TransactionMeta::new(digest, Timestamp::from_micros(1), vec![sig]);
        assert!(!tx.keys_recovered());
        assert_eq!(tx.recover_keys(), &[key.public_key()]);
        assert!(tx.keys_recovered());
    }

    #[test]
    fn invalid_signatures_recover_no_keys() {
        let digest = Digest::hash(b"transfer");
        let tx = TransactionMeta::new(digest, Timestamp::ZERO, vec![Signature::ZERO]);
        assert!(tx.recover_keys().is_empty());
    }

    #[test]
    fn id_depends_on_expiration() {
        let digest = Digest::hash(b"transfer");
        let a = TransactionMeta::new(digest, Timestamp::from_micros(1), vec![]);
        let b = TransactionMeta::new(digest, Timestamp::from_micros(2), vec![]);
        assert_ne!(a.id(), b.id());
    }
}
