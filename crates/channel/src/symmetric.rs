//! Symmetric handshake state: transcript hash, chaining key, message key.

use core_vault::{SecretAttributes, SecretHandle, SecretType, Vault, SHA256_SIZE};

use crate::error::ChannelError;

const KDF_OUTPUTS: [SecretAttributes; 2] = [
    SecretAttributes::ephemeral(SecretType::Buffer),
    SecretAttributes::ephemeral(SecretType::Aes128),
];

const SPLIT_OUTPUTS: [SecretAttributes; 2] = [
    SecretAttributes::ephemeral(SecretType::Aes128),
    SecretAttributes::ephemeral(SecretType::Aes128),
];

/// `h`, `ck`, `k`, `n` from the Noise spec. The chaining key and message key
/// are vault secrets; the caller lends its vault to every operation.
pub(crate) struct SymmetricState {
    h: [u8; SHA256_SIZE],
    ck: Option<SecretHandle>,
    k: Option<SecretHandle>,
    n: u64,
}

impl SymmetricState {
    /// `h = name || zero padding`, `ck = h` imported as a buffer secret,
    /// `k` empty. The 28-byte protocol name fits the 32-byte hash, so no
    /// initial hashing happens.
    pub fn initialize<V: Vault>(
        vault: &mut V,
        protocol_name: &[u8; 28],
    ) -> Result<Self, ChannelError> {
        let mut h = [0u8; SHA256_SIZE];
        h[..protocol_name.len()].copy_from_slice(protocol_name);
        let ck = vault.secret_import(SecretAttributes::ephemeral(SecretType::Buffer), &h)?;
        Ok(SymmetricState {
            h,
            ck: Some(ck),
            k: None,
            n: 0,
        })
    }

    pub fn handshake_hash(&self) -> [u8; SHA256_SIZE] {
        self.h
    }

    /// `h = SHA256(h || data)`
    pub fn mix_hash<V: Vault>(&mut self, vault: &mut V, data: &[u8]) -> Result<(), ChannelError> {
        let mut input = Vec::with_capacity(SHA256_SIZE + data.len());
        input.extend_from_slice(&self.h);
        input.extend_from_slice(data);
        self.h = vault.sha256(&input)?;
        Ok(())
    }

    /// `(ck, k) = HKDF(ck, ikm)`; consumes the DH input, replaces both keys,
    /// resets the nonce counter.
    pub fn mix_key<V: Vault>(
        &mut self,
        vault: &mut V,
        ikm: SecretHandle,
    ) -> Result<(), ChannelError> {
        let derived = vault.hkdf_sha256(self.ck()?, Some(ikm), &KDF_OUTPUTS);
        vault.secret_destroy(ikm)?;
        let derived = derived?;

        if let Some(old) = self.ck.replace(derived[0]) {
            vault.secret_destroy(old)?;
        }
        if let Some(old) = self.k.replace(derived[1]) {
            vault.secret_destroy(old)?;
        }
        self.n = 0;
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        self.k.is_some()
    }

    /// Encrypt with `h` as AAD and fold the ciphertext into the transcript.
    /// Before the first `mix_key` there is no key and the plaintext passes
    /// through unchanged.
    pub fn encrypt_and_hash<V: Vault>(
        &mut self,
        vault: &mut V,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ChannelError> {
        let k = match self.k {
            None => {
                self.mix_hash(vault, plaintext)?;
                return Ok(plaintext.to_vec());
            }
            Some(k) => k,
        };
        let ciphertext = vault.aead_aes_128_gcm_encrypt(k, self.n, &self.h, plaintext)?;
        self.mix_hash(vault, &ciphertext)?;
        self.n += 1;
        Ok(ciphertext)
    }

    /// Inverse of `encrypt_and_hash`. The transcript absorbs the pre-decrypt
    /// ciphertext bytes.
    pub fn decrypt_and_hash<V: Vault>(
        &mut self,
        vault: &mut V,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ChannelError> {
        let k = match self.k {
            None => {
                self.mix_hash(vault, ciphertext)?;
                return Ok(ciphertext.to_vec());
            }
            Some(k) => k,
        };
        let plaintext = vault.aead_aes_128_gcm_decrypt(k, self.n, &self.h, ciphertext)?;
        self.mix_hash(vault, ciphertext)?;
        self.n += 1;
        Ok(plaintext)
    }

    /// `(k1, k2) = HKDF(ck, empty)`. Consumes `ck` and `k`; the state keeps
    /// only the final transcript hash afterwards.
    pub fn split<V: Vault>(
        &mut self,
        vault: &mut V,
    ) -> Result<(SecretHandle, SecretHandle), ChannelError> {
        let derived = vault.hkdf_sha256(self.ck()?, None, &SPLIT_OUTPUTS)?;
        if let Some(ck) = self.ck.take() {
            vault.secret_destroy(ck)?;
        }
        if let Some(k) = self.k.take() {
            vault.secret_destroy(k)?;
        }
        Ok((derived[0], derived[1]))
    }

    /// Best-effort release of whatever the state still owns. Used on failure
    /// and cancellation paths, where the original error must win.
    pub fn destroy<V: Vault>(&mut self, vault: &mut V) {
        if let Some(ck) = self.ck.take() {
            let _ = vault.secret_destroy(ck);
        }
        if let Some(k) = self.k.take() {
            let _ = vault.secret_destroy(k);
        }
    }

    fn ck(&self) -> Result<SecretHandle, ChannelError> {
        self.ck.ok_or(ChannelError::State)
    }
}
