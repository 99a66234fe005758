//! Server keypair
//!
//! One RSA keypair per process, generated on the first connection and
//! shared read-only afterwards.

use std::sync::Arc;

use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::OnceCell;
use tracing::info;

use crate::crypto;
use crate::error::{AppError, CryptoError};

/// The server's keypair
#[derive(Debug)]
pub struct ServerIdentity {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl ServerIdentity {
    /// Generate a new keypair (CPU heavy, call off the async workers)
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private_key = crypto::generate_private_key(bits)?;
        let public_key = private_key.to_public_key();
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Decimal `(modulus, exponent)` as sent during the handshake
    pub fn public_components(&self) -> (String, String) {
        crypto::public_key_components(&self.public_key)
    }

    /// Decrypt a private-message payload addressed to the server
    pub fn decrypt_private(&self, payload: &str) -> Result<String, CryptoError> {
        crypto::decrypt_private(payload, &self.private_key)
    }
}

/// Lazily generated, process-wide `ServerIdentity`
///
/// Concurrent first callers wait on the same generation, so exactly one
/// keypair ever exists.
#[derive(Debug)]
pub struct LazyIdentity {
    bits: usize,
    cell: OnceCell<Arc<ServerIdentity>>,
}

impl LazyIdentity {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            cell: OnceCell::new(),
        }
    }

    /// Return the identity, generating it on first use
    pub async fn ensure(&self) -> Result<Arc<ServerIdentity>, AppError> {
        let bits = self.bits;
        self.ensure_with(move || ServerIdentity::generate(bits)).await
    }

    /// `ensure` with the blocking generator supplied by the caller
    ///
    /// A generator that panics leaves the cell empty and fails fatally.
    async fn ensure_with<F>(&self, generate: F) -> Result<Arc<ServerIdentity>, AppError>
    where
        F: FnOnce() -> Result<ServerIdentity, CryptoError> + Send + 'static,
    {
        let bits = self.bits;
        let identity = self
            .cell
            .get_or_try_init(|| async move {
                info!("Generating {}-bit server keypair", bits);
                let identity = tokio::task::spawn_blocking(generate)
                    .await
                    .map_err(AppError::KeyGenerationTask)?
                    .map_err(AppError::KeyGeneration)?;
                info!("Server keypair ready");
                Ok::<_, AppError>(Arc::new(identity))
            })
            .await?;
        Ok(Arc::clone(identity))
    }

    /// The identity if it has already been generated
    pub fn get(&self) -> Option<Arc<ServerIdentity>> {
        self.cell.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_until_first_use() {
        let identity = LazyIdentity::new(1024);
        assert!(identity.get().is_none());

        let first = identity.ensure().await.unwrap();
        let second = identity.ensure().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(identity.get().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_generates_once() {
        let identity = Arc::new(LazyIdentity::new(1024));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let identity = Arc::clone(&identity);
                tokio::spawn(async move { identity.ensure().await.unwrap() })
            })
            .collect();

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap());
        }
        assert!(keys.iter().all(|k| Arc::ptr_eq(k, &keys[0])));
    }

    #[tokio::test]
    async fn test_generator_panic_is_fatal() {
        let identity = LazyIdentity::new(1024);

        let err = identity
            .ensure_with(|| panic!("entropy source unavailable"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::KeyGenerationTask(_)));
        assert!(err.is_fatal());
        assert!(identity.get().is_none());
    }

    #[tokio::test]
    async fn test_generator_error_is_fatal() {
        let identity = LazyIdentity::new(1024);

        let err = identity
            .ensure_with(|| Err(CryptoError::InvalidKeyComponent("bits".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::KeyGeneration(_)));
        assert!(err.is_fatal());
        assert!(identity.get().is_none());
    }

    #[test]
    fn test_decrypt_own_payload() {
        let identity = ServerIdentity::generate(1024).unwrap();
        let payload = crypto::encrypt_private("bob:secret", identity.public_key()).unwrap();
        assert_eq!(identity.decrypt_private(&payload).unwrap(), "bob:secret");
    }
}
