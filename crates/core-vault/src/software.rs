//! In-memory vault backed by ring and curve25519-dalek.

use std::collections::HashMap;

use curve25519_dalek::montgomery::MontgomeryPoint;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use ring::digest;
use ring::hkdf::{KeyType, Salt, HKDF_SHA256};
use ring::rand::{SecureRandom, SystemRandom};

use crate::{
    SecretAttributes, SecretHandle, SecretPersistence, SecretType, Vault, VaultError,
    AES128_KEY_SIZE, AEAD_TAG_SIZE, SHA256_SIZE, X25519_KEY_SIZE,
};

struct SecretEntry {
    attributes: SecretAttributes,
    material: Vec<u8>,
}

/// Software key custodian. All secrets live in process memory; `Persistent`
/// is honored across [`SoftwareVault::reopen`] but not across process exit.
pub struct SoftwareVault {
    rng: SystemRandom,
    secrets: HashMap<u64, SecretEntry>,
    next_id: u64,
}

impl SoftwareVault {
    pub fn new() -> Self {
        SoftwareVault {
            rng: SystemRandom::new(),
            secrets: HashMap::new(),
            next_id: 1,
        }
    }

    /// Close and reopen the vault: ephemeral secrets are dropped, persistent
    /// secrets keep their handles.
    pub fn reopen(mut self) -> Self {
        self.secrets
            .retain(|_, entry| entry.attributes.persistence == SecretPersistence::Persistent);
        self
    }

    /// Number of live secrets. Lets tests prove that every handle created on
    /// a path was also destroyed on it.
    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    fn entry(&self, handle: SecretHandle) -> Result<&SecretEntry, VaultError> {
        self.secrets
            .get(&handle.id())
            .ok_or(VaultError::UnknownSecret)
    }

    fn insert(&mut self, attributes: SecretAttributes, material: Vec<u8>) -> SecretHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.secrets.insert(
            id,
            SecretEntry {
                attributes,
                material,
            },
        );
        SecretHandle::new(id)
    }

    fn key_material(&self, handle: SecretHandle, stype: SecretType) -> Result<&[u8], VaultError> {
        let entry = self.entry(handle)?;
        if entry.attributes.stype != stype {
            return Err(VaultError::InvalidSecretType);
        }
        Ok(&entry.material)
    }

    fn x25519_private(&self, handle: SecretHandle) -> Result<[u8; X25519_KEY_SIZE], VaultError> {
        let material = self.key_material(handle, SecretType::X25519)?;
        material.try_into().map_err(|_| VaultError::InvalidLength)
    }

    fn aes128_key(&self, handle: SecretHandle) -> Result<LessSafeKey, VaultError> {
        let material = self.key_material(handle, SecretType::Aes128)?;
        let unbound = UnboundKey::new(&AES_128_GCM, material).map_err(|_| VaultError::Aead)?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl Default for SoftwareVault {
    fn default() -> Self {
        Self::new()
    }
}

// 0x00000000 || counter, big-endian, per the AES-GCM profile of the channel.
fn make_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::assume_unique_for_key(bytes)
}

// Runtime-sized OKM length marker for ring's HKDF.
struct OkmLen(usize);

impl KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn generated_len(stype: SecretType) -> usize {
    match stype {
        SecretType::Buffer => 32,
        SecretType::Aes128 => AES128_KEY_SIZE,
        SecretType::X25519 => X25519_KEY_SIZE,
    }
}

impl Vault for SoftwareVault {
    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<(), VaultError> {
        self.rng.fill(buf).map_err(|_| VaultError::Random)
    }

    fn sha256(&mut self, input: &[u8]) -> Result<[u8; SHA256_SIZE], VaultError> {
        let digest = digest::digest(&digest::SHA256, input);
        let mut out = [0u8; SHA256_SIZE];
        out.copy_from_slice(digest.as_ref());
        Ok(out)
    }

    fn secret_generate(&mut self, attributes: SecretAttributes) -> Result<SecretHandle, VaultError> {
        let mut material = vec![0u8; generated_len(attributes.stype)];
        self.rng
            .fill(&mut material)
            .map_err(|_| VaultError::Random)?;
        Ok(self.insert(attributes, material))
    }

    fn secret_import(
        &mut self,
        attributes: SecretAttributes,
        material: &[u8],
    ) -> Result<SecretHandle, VaultError> {
        let valid = match attributes.stype {
            SecretType::Buffer => !material.is_empty(),
            SecretType::Aes128 => material.len() == AES128_KEY_SIZE,
            SecretType::X25519 => material.len() == X25519_KEY_SIZE,
        };
        if !valid {
            return Err(VaultError::InvalidLength);
        }
        Ok(self.insert(attributes, material.to_vec()))
    }

    fn secret_export(&mut self, handle: SecretHandle) -> Result<Vec<u8>, VaultError> {
        let entry = self.entry(handle)?;
        match entry.attributes.stype {
            SecretType::Buffer | SecretType::Aes128 => Ok(entry.material.clone()),
            SecretType::X25519 => Err(VaultError::ExportForbidden),
        }
    }

    fn secret_publickey_get(
        &mut self,
        handle: SecretHandle,
    ) -> Result<[u8; X25519_KEY_SIZE], VaultError> {
        let private = self.x25519_private(handle)?;
        Ok(MontgomeryPoint::mul_base_clamped(private).to_bytes())
    }

    fn secret_attributes_get(
        &mut self,
        handle: SecretHandle,
    ) -> Result<SecretAttributes, VaultError> {
        Ok(self.entry(handle)?.attributes)
    }

    fn secret_destroy(&mut self, handle: SecretHandle) -> Result<(), VaultError> {
        // Overwrite before dropping so the allocation does not keep key bytes.
        let mut entry = self
            .secrets
            .remove(&handle.id())
            .ok_or(VaultError::UnknownSecret)?;
        entry.material.fill(0);
        Ok(())
    }

    fn ecdh(
        &mut self,
        private: SecretHandle,
        peer_public: &[u8; X25519_KEY_SIZE],
    ) -> Result<SecretHandle, VaultError> {
        let sk = self.x25519_private(private)?;
        let shared = MontgomeryPoint(*peer_public).mul_clamped(sk).to_bytes();
        // A low-order peer point collapses the shared secret to zero.
        if shared.iter().all(|&b| b == 0) {
            return Err(VaultError::Ecdh);
        }
        Ok(self.insert(
            SecretAttributes::ephemeral(SecretType::Buffer),
            shared.to_vec(),
        ))
    }

    fn hkdf_sha256(
        &mut self,
        salt: SecretHandle,
        ikm: Option<SecretHandle>,
        outputs: &[SecretAttributes],
    ) -> Result<Vec<SecretHandle>, VaultError> {
        if outputs.is_empty() {
            return Err(VaultError::Hkdf);
        }
        let salt_bytes = self.key_material(salt, SecretType::Buffer)?.to_vec();
        let ikm_bytes = match ikm {
            Some(handle) => self.key_material(handle, SecretType::Buffer)?.to_vec(),
            None => Vec::new(),
        };

        let prk = Salt::new(HKDF_SHA256, &salt_bytes).extract(&ikm_bytes);
        let mut okm = vec![0u8; SHA256_SIZE * outputs.len()];
        let info: [&[u8]; 1] = [&[]];
        prk.expand(&info, OkmLen(okm.len()))
            .map_err(|_| VaultError::Hkdf)?
            .fill(&mut okm)
            .map_err(|_| VaultError::Hkdf)?;

        let mut handles = Vec::with_capacity(outputs.len());
        for (attributes, block) in outputs.iter().zip(okm.chunks_exact(SHA256_SIZE)) {
            let material = match attributes.stype {
                SecretType::Buffer => block.to_vec(),
                SecretType::Aes128 => block[..AES128_KEY_SIZE].to_vec(),
                SecretType::X25519 => {
                    for handle in handles.drain(..) {
                        let _ = self.secret_destroy(handle);
                    }
                    return Err(VaultError::InvalidSecretType);
                }
            };
            handles.push(self.insert(*attributes, material));
        }
        okm.fill(0);
        Ok(handles)
    }

    fn aead_aes_128_gcm_encrypt(
        &mut self,
        key: SecretHandle,
        nonce: u64,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        let key = self.aes128_key(key)?;
        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(make_nonce(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| VaultError::Aead)?;
        Ok(in_out)
    }

    fn aead_aes_128_gcm_decrypt(
        &mut self,
        key: SecretHandle,
        nonce: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        if ciphertext.len() < AEAD_TAG_SIZE {
            return Err(VaultError::Aead);
        }
        let key = self.aes128_key(key)?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(make_nonce(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| VaultError::Aead)?;
        Ok(plaintext.to_vec())
    }
}
