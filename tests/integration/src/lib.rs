//! Shared helpers for the end-to-end secure channel suite.

use core_vault::{SecretAttributes, SecretHandle, SecretType, SoftwareVault, Vault};

/// Fresh vault holding one persistent static key.
pub fn vault_with_static_key() -> (SoftwareVault, SecretHandle) {
    let mut vault = SoftwareVault::new();
    let static_key = vault
        .secret_generate(SecretAttributes::persistent(SecretType::X25519))
        .expect("generate static key");
    (vault, static_key)
}
