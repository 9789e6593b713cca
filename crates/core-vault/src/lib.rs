//! Key custodian: secret material lives behind opaque handles.
//!
//! Callers name secrets by [`SecretHandle`] and drive every primitive
//! (random, SHA-256, HKDF, AEAD, X25519) through the [`Vault`] trait, so raw
//! key bytes never cross the boundary except through [`Vault::secret_export`],
//! which policy restricts to buffer and symmetric-key secrets.

mod software;

pub use software::SoftwareVault;

/// SHA-256 digest length in bytes.
pub const SHA256_SIZE: usize = 32;
/// X25519 public and private key length in bytes.
pub const X25519_KEY_SIZE: usize = 32;
/// AES-128 key length in bytes.
pub const AES128_KEY_SIZE: usize = 16;
/// AES-GCM authentication tag length in bytes.
pub const AEAD_TAG_SIZE: usize = 16;

/// Opaque reference to a secret owned by a vault.
///
/// Handles are only meaningful to the vault that issued them; comparing two
/// handles says nothing about the material behind them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecretHandle(u64);

impl SecretHandle {
    pub(crate) fn new(id: u64) -> Self {
        SecretHandle(id)
    }

    pub(crate) fn id(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretType {
    /// Raw bytes: HKDF inputs and outputs, ECDH shared points.
    Buffer,
    /// AES-128-GCM key.
    Aes128,
    /// X25519 private key.
    X25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretPersistence {
    /// Dropped when the vault is reopened.
    Ephemeral,
    /// Survives a vault reopen.
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretPurpose {
    KeyAgreement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretAttributes {
    pub stype: SecretType,
    pub persistence: SecretPersistence,
    pub purpose: SecretPurpose,
}

impl SecretAttributes {
    pub const fn ephemeral(stype: SecretType) -> Self {
        SecretAttributes {
            stype,
            persistence: SecretPersistence::Ephemeral,
            purpose: SecretPurpose::KeyAgreement,
        }
    }

    pub const fn persistent(stype: SecretType) -> Self {
        SecretAttributes {
            stype,
            persistence: SecretPersistence::Persistent,
            purpose: SecretPurpose::KeyAgreement,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("unknown or destroyed secret handle")]
    UnknownSecret,
    #[error("secret type does not permit this operation")]
    InvalidSecretType,
    #[error("secret export forbidden by policy")]
    ExportForbidden,
    #[error("key material has the wrong length")]
    InvalidLength,
    #[error("random generator failure")]
    Random,
    #[error("x25519 agreement failure")]
    Ecdh,
    #[error("aead authentication failure")]
    Aead,
    #[error("hkdf expansion failure")]
    Hkdf,
}

/// Capability interface over a key custodian.
///
/// A vault value is single-owner: operations take `&mut self` and callers
/// that need to share one wrap it in a mutex. The blanket impl below lets a
/// component borrow a caller-owned vault for the duration of an exchange.
pub trait Vault {
    /// Fill `buf` with cryptographic-quality random bytes.
    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<(), VaultError>;

    /// SHA-256 of `input`.
    fn sha256(&mut self, input: &[u8]) -> Result<[u8; SHA256_SIZE], VaultError>;

    /// Create a fresh secret matching `attributes`.
    ///
    /// For X25519 secrets the public key is provisioned implicitly and
    /// retrievable via [`Vault::secret_publickey_get`].
    fn secret_generate(&mut self, attributes: SecretAttributes) -> Result<SecretHandle, VaultError>;

    /// Import externally supplied key material.
    fn secret_import(
        &mut self,
        attributes: SecretAttributes,
        material: &[u8],
    ) -> Result<SecretHandle, VaultError>;

    /// Export secret material. Allowed for `Buffer` and `Aes128` secrets;
    /// X25519 private keys stay inside the vault.
    fn secret_export(&mut self, handle: SecretHandle) -> Result<Vec<u8>, VaultError>;

    /// Public key of an X25519 private-key secret.
    fn secret_publickey_get(
        &mut self,
        handle: SecretHandle,
    ) -> Result<[u8; X25519_KEY_SIZE], VaultError>;

    fn secret_attributes_get(&mut self, handle: SecretHandle)
        -> Result<SecretAttributes, VaultError>;

    /// Release a secret. The handle is dead afterwards.
    fn secret_destroy(&mut self, handle: SecretHandle) -> Result<(), VaultError>;

    /// X25519 agreement between a private-key secret and a peer public key.
    ///
    /// The 32-byte shared point is materialized as a new `Buffer` secret and
    /// never returned to the caller directly.
    fn ecdh(
        &mut self,
        private: SecretHandle,
        peer_public: &[u8; X25519_KEY_SIZE],
    ) -> Result<SecretHandle, VaultError>;

    /// HKDF-SHA256 extract-then-expand.
    ///
    /// Expands `32 * outputs.len()` bytes and materializes one secret per
    /// entry; an `Aes128` output takes the first 16 bytes of its block.
    fn hkdf_sha256(
        &mut self,
        salt: SecretHandle,
        ikm: Option<SecretHandle>,
        outputs: &[SecretAttributes],
    ) -> Result<Vec<SecretHandle>, VaultError>;

    /// AES-128-GCM seal. The nonce is `0x00000000 || counter` big-endian;
    /// the 16-byte tag is appended to the ciphertext.
    fn aead_aes_128_gcm_encrypt(
        &mut self,
        key: SecretHandle,
        nonce: u64,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, VaultError>;

    /// AES-128-GCM open. Fails with [`VaultError::Aead`] when the tag does
    /// not authenticate.
    fn aead_aes_128_gcm_decrypt(
        &mut self,
        key: SecretHandle,
        nonce: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, VaultError>;
}

impl<V: Vault + ?Sized> Vault for &mut V {
    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<(), VaultError> {
        (**self).random_bytes(buf)
    }

    fn sha256(&mut self, input: &[u8]) -> Result<[u8; SHA256_SIZE], VaultError> {
        (**self).sha256(input)
    }

    fn secret_generate(&mut self, attributes: SecretAttributes) -> Result<SecretHandle, VaultError> {
        (**self).secret_generate(attributes)
    }

    fn secret_import(
        &mut self,
        attributes: SecretAttributes,
        material: &[u8],
    ) -> Result<SecretHandle, VaultError> {
        (**self).secret_import(attributes, material)
    }

    fn secret_export(&mut self, handle: SecretHandle) -> Result<Vec<u8>, VaultError> {
        (**self).secret_export(handle)
    }

    fn secret_publickey_get(
        &mut self,
        handle: SecretHandle,
    ) -> Result<[u8; X25519_KEY_SIZE], VaultError> {
        (**self).secret_publickey_get(handle)
    }

    fn secret_attributes_get(
        &mut self,
        handle: SecretHandle,
    ) -> Result<SecretAttributes, VaultError> {
        (**self).secret_attributes_get(handle)
    }

    fn secret_destroy(&mut self, handle: SecretHandle) -> Result<(), VaultError> {
        (**self).secret_destroy(handle)
    }

    fn ecdh(
        &mut self,
        private: SecretHandle,
        peer_public: &[u8; X25519_KEY_SIZE],
    ) -> Result<SecretHandle, VaultError> {
        (**self).ecdh(private, peer_public)
    }

    fn hkdf_sha256(
        &mut self,
        salt: SecretHandle,
        ikm: Option<SecretHandle>,
        outputs: &[SecretAttributes],
    ) -> Result<Vec<SecretHandle>, VaultError> {
        (**self).hkdf_sha256(salt, ikm, outputs)
    }

    fn aead_aes_128_gcm_encrypt(
        &mut self,
        key: SecretHandle,
        nonce: u64,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        (**self).aead_aes_128_gcm_encrypt(key, nonce, aad, plaintext)
    }

    fn aead_aes_128_gcm_decrypt(
        &mut self,
        key: SecretHandle,
        nonce: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        (**self).aead_aes_128_gcm_decrypt(key, nonce, aad, ciphertext)
    }
}
