#![cfg_attr(not(test), warn(unused_crate_dependencies))]

//! Signature providers map a producer's public key to something that can sign
//! a 32-byte digest: either an in-process private key, or a remote wallet
//! daemon reached over HTTP. The registry is built once at startup and is
//! immutable for the life of the process.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use palisade_primitives::crypto::CryptoError;
use palisade_primitives::{Digest, PrivateKey, PublicKey, Signature};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

pub(crate) const LOG_TARGET: &str = "signer";

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// No provider is registered for the requested signing key.
    #[error("no signature provider registered for key {0}")]
    KeyNotFound(PublicKey),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("wallet daemon request failed: {0}")]
    Wallet(#[from] reqwest::Error),

    #[error("wallet daemon returned a malformed signature: {0}")]
    MalformedWalletResponse(String),

    #[error("malformed signature provider spec: {0}")]
    MalformedSpec(String),
}

/// One entry of the registry: something that turns a digest into a signature.
#[derive(Debug)]
pub enum SignatureProvider {
    /// Signs in-process with a private key held in memory.
    Local(PrivateKey),
    /// Delegates signing to an external wallet daemon.
    Wallet(WalletSigner),
}

impl SignatureProvider {
    pub fn sign(&self, digest: &Digest) -> Result<Signature, SignerError> {
        match self {
            Self::Local(key) => Ok(key.sign(digest)?),
            Self::Wallet(signer) => signer.sign(digest),
        }
    }
}

/// Signs by POSTing `[digest, public_key]` to a wallet daemon holding the
/// unlocked key, bounded by the configured timeout.
#[derive(Debug)]
pub struct WalletSigner {
    url: Url,
    public_key: PublicKey,
    client: reqwest::blocking::Client,
    /// Once the owning node shuts down, the signer goes dead and returns the
    /// zero signature, which every verifier rejects.
    shutdown: CancellationToken,
}

impl WalletSigner {
    pub fn new(
        url: Url,
        public_key: PublicKey,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self, SignerError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, public_key, client, shutdown })
    }

    fn sign(&self, digest: &Digest) -> Result<Signature, SignerError> {
        if self.shutdown.is_cancelled() {
            return Ok(Signature::ZERO);
        }

        // The wallet call is synchronous by design; get off the async worker
        // so the runtime can keep making progress while we wait.
        let response = tokio::task::block_in_place(|| {
            self.client
                .post(self.url.clone())
                .json(&(digest.to_string(), self.public_key.to_string()))
                .send()?
                .error_for_status()?
                .json::<String>()
        })?;

        response
            .parse::<Signature>()
            .map_err(|_| SignerError::MalformedWalletResponse(response))
    }
}

/// Parsed form of a `<public-key>=<provider-type>:<data>` spec string, where
/// the provider type is `KEY` (inline private key) or `WALLET` (daemon URL).
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub public_key: PublicKey,
    pub kind: ProviderSpecKind,
}

#[derive(Debug, Clone)]
pub enum ProviderSpecKind {
    Key(PrivateKey),
    Wallet(Url),
}

impl FromStr for ProviderSpec {
    type Err = SignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SignerError::MalformedSpec(s.to_string());

        let (public_key, spec) = s.split_once('=').ok_or_else(malformed)?;
        let public_key = public_key.parse::<PublicKey>().map_err(|_| malformed())?;
        let (kind, data) = spec.split_once(':').ok_or_else(malformed)?;

        let kind = match kind {
            "KEY" => ProviderSpecKind::Key(data.parse().map_err(|_| malformed())?),
            "WALLET" => ProviderSpecKind::Wallet(data.parse().map_err(|_| malformed())?),
            _ => return Err(malformed()),
        };

        Ok(Self { public_key, kind })
    }
}

/// Registry of all signing keys this node can use, keyed by public key.
#[derive(Debug, Default)]
pub struct SignerRegistry {
    providers: HashMap<PublicKey, SignatureProvider>,
    shutdown: CancellationToken,
}

impl SignerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a local in-process key.
    pub fn insert_key(&mut self, key: PrivateKey) {
        let public_key = key.public_key();
        debug!(target: LOG_TARGET, %public_key, "Registered local signing key.");
        self.providers.insert(public_key, SignatureProvider::Local(key));
    }

    /// Registers a provider from a parsed spec string.
    pub fn insert_spec(&mut self, spec: ProviderSpec, timeout: Duration) -> Result<(), SignerError> {
        let provider = match spec.kind {
            ProviderSpecKind::Key(key) => SignatureProvider::Local(key),
            ProviderSpecKind::Wallet(url) => SignatureProvider::Wallet(WalletSigner::new(
                url,
                spec.public_key,
                timeout,
                self.shutdown.child_token(),
            )?),
        };

        debug!(target: LOG_TARGET, public_key = %spec.public_key, "Registered signature provider.");
        self.providers.insert(spec.public_key, provider);
        Ok(())
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.providers.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Signs `digest` with the provider registered for `key`.
    pub fn sign(&self, key: &PublicKey, digest: &Digest) -> Result<Signature, SignerError> {
        let provider = self.providers.get(key).ok_or(SignerError::KeyNotFound(*key))?;
        provider.sign(digest)
    }

    /// Kills all wallet-backed providers. Local keys keep working so that an
    /// in-flight block sign can still complete during teardown.
    pub fn revoke_remote(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use palisade_primitives::Digest;

    use super::*;

    #[test]
    fn local_provider_signs() {
        let key = PrivateKey::from_seed("alice");
        let public_key = key.public_key();

        let mut registry = SignerRegistry::new();
        registry.insert_key(key.clone());

        let digest = Digest::hash(b"block");
        let signature = registry.sign(&public_key, &digest).unwrap();
        assert_eq!(signature.recover(&digest).unwrap(), public_key);
    }

    #[test]
    fn missing_key_is_an_error() {
        let registry = SignerRegistry::new();
        let key = PrivateKey::from_seed("bob").public_key();
        assert_matches!(
            registry.sign(&key, &Digest::hash(b"block")),
            Err(SignerError::KeyNotFound(missing)) if missing == key
        );
    }

    #[test]
    fn parses_key_spec() {
        let key = PrivateKey::from_seed("alice");
        let spec_str = format!("{}=KEY:{}", key.public_key(), key.to_hex());
        let spec: ProviderSpec = spec_str.parse().unwrap();
        assert_eq!(spec.public_key, key.public_key());
        assert_matches!(spec.kind, ProviderSpecKind::Key(parsed) if parsed.public_key() == key.public_key());
    }

    #[test]
    fn parses_wallet_spec() {
        let key = PrivateKey::from_seed("alice").public_key();
        let spec: ProviderSpec =
            format!("{key}=WALLET:http://127.0.0.1:6666/v1/wallet/sign_digest").parse().unwrap();
        assert_matches!(spec.kind, ProviderSpecKind::Wallet(url) if url.port() == Some(6666));
    }

    #[test]
    fn rejects_malformed_specs() {
        assert_matches!("garbage".parse::<ProviderSpec>(), Err(SignerError::MalformedSpec(_)));
        let key = PrivateKey::from_seed("alice").public_key();
        assert_matches!(
            format!("{key}=HSM:whatever").parse::<ProviderSpec>(),
            Err(SignerError::MalformedSpec(_))
        );
    }
}
