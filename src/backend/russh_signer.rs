//! `Signer` implementation backed by a `russh`-native private key.

use std::path::Path;

use async_trait::async_trait;
use russh::keys::signature::Signer as _;
use russh::keys::{PrivateKey, PublicKey};

use crate::transport::Signer;
use crate::{Error, Result};

/// Wraps a loaded `russh` private key. Paired with [`super::RusshTransport`],
/// which recovers the native key through [`Signer::as_any`] and drives
/// `authenticate_publickey` directly rather than going through
/// [`Signer::sign`] — that method exists so a caller's own `Transport` can
/// still use this signer generically.
pub struct RusshSigner {
    key: PrivateKey,
}

impl RusshSigner {
    /// Wrap an already-loaded key.
    #[must_use]
    pub fn from_private_key(key: PrivateKey) -> Self {
        Self { key }
    }

    /// Load an unencrypted (or passphrase-less) private key from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the file cannot be read or
    /// parsed as an SSH private key.
    pub fn from_file(path: &Path) -> Result<Self> {
        let key = russh::keys::load_secret_key(path, None)
            .map_err(|e| Error::Authentication(format!("failed to load private key: {e}")))?;
        Ok(Self { key })
    }

    /// The native key, recovered by [`super::RusshTransport`] via downcast.
    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    fn public_key(&self) -> &PublicKey {
        self.key.public_key()
    }
}

#[async_trait]
impl Signer for RusshSigner {
    fn public_key_blob(&self) -> Vec<u8> {
        self.public_key().to_bytes().unwrap_or_default()
    }

    async fn sign(&self, data: &[u8], algorithm_name: &str) -> Result<Vec<u8>> {
        // RusshTransport never calls this for the default pairing (it signs
        // through authenticate_publickey using the native key directly).
        // Kept for callers pairing this signer with their own Transport.
        let _ = algorithm_name;
        let signature = self.key.try_sign(data).map_err(|e| Error::Authentication(e.to_string()))?;
        Ok(signature.as_bytes().to_vec())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
