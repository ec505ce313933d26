// src/core/security.rs

//! The security seam consulted for encrypted pools and blocks.
//!
//! The cryptographic scheme itself is out of scope for the core; the trait
//! preserves the interface shape so a real provider can be slotted in. The
//! default provider approves every operation and passes data through
//! unchanged.

use crate::core::LatZeroError;
use async_trait::async_trait;

/// Operations the core delegates to the security layer.
#[async_trait]
pub trait SecurityProvider: Send + Sync + std::fmt::Debug {
    /// Whether `app_id` may perform `op` against the encrypted pool `pool`.
    async fn check_pool_access(
        &self,
        app_id: &str,
        pool: &str,
        op: &str,
    ) -> Result<bool, LatZeroError>;

    /// Provisions key material for a newly created encrypted pool and
    /// returns an opaque key-material reference to persist.
    async fn prepare_encrypted_pool(&self, pool: &str) -> Result<String, LatZeroError>;

    /// Encrypts block data belonging to an encrypted pool.
    async fn encrypt_block(&self, pool: &str, data: &[u8]) -> Result<Vec<u8>, LatZeroError>;

    /// Decrypts block data belonging to an encrypted pool.
    async fn decrypt_block(&self, pool: &str, data: &[u8]) -> Result<Vec<u8>, LatZeroError>;

    /// Rotates the key material of an encrypted pool.
    async fn rotate_keys(&self, pool: &str) -> Result<(), LatZeroError>;
}

/// The stub provider: approves all operations, stores no keys, and treats
/// encryption as the identity transform.
#[derive(Debug, Default)]
pub struct AllowAllSecurity;

#[async_trait]
impl SecurityProvider for AllowAllSecurity {
    async fn check_pool_access(
        &self,
        _app_id: &str,
        _pool: &str,
        _op: &str,
    ) -> Result<bool, LatZeroError> {
        Ok(true)
    }

    async fn prepare_encrypted_pool(&self, pool: &str) -> Result<String, LatZeroError> {
        Ok(format!("stub-key:{pool}"))
    }

    async fn encrypt_block(&self, _pool: &str, data: &[u8]) -> Result<Vec<u8>, LatZeroError> {
        Ok(data.to_vec())
    }

    async fn decrypt_block(&self, _pool: &str, data: &[u8]) -> Result<Vec<u8>, LatZeroError> {
        Ok(data.to_vec())
    }

    async fn rotate_keys(&self, _pool: &str) -> Result<(), LatZeroError> {
        Ok(())
    }
}
