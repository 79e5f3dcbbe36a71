//! Identity encryptor for local development and the file-backed CLI.

use async_trait::async_trait;

use super::errors::BackendResult;
use super::Encryptor;

/// Passes bytes through unchanged.
///
/// Only suitable where the ledger itself is trusted storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextEncryptor;

#[async_trait]
impl Encryptor for PlaintextEncryptor {
    async fn encrypt(&self, plaintext: Vec<u8>) -> BackendResult<Vec<u8>> {
        Ok(plaintext)
    }

    async fn decrypt(&self, ciphertext: Vec<u8>) -> BackendResult<Vec<u8>> {
        Ok(ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passthrough() {
        let enc = PlaintextEncryptor;
        let sealed = enc.encrypt(b"abc".to_vec()).await.unwrap();
        assert_eq!(sealed, b"abc");
        assert_eq!(enc.decrypt(sealed).await.unwrap(), b"abc");
    }
}
