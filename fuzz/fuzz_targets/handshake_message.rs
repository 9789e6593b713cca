#![no_main]
use arbitrary::Arbitrary;
use channel::Handshake;
use core_vault::{SecretAttributes, SecretType, SoftwareVault, Vault};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    message1: Vec<u8>,
    message2: Vec<u8>,
    message3: Vec<u8>,
}

fn static_key(vault: &mut SoftwareVault) -> core_vault::SecretHandle {
    vault
        .secret_generate(SecretAttributes::ephemeral(SecretType::X25519))
        .expect("static key")
}

fuzz_target!(|inp: Input| {
    // A responder fed arbitrary wire bytes must error cleanly, never panic,
    // and never leak vault secrets past the failure.
    {
        let mut vault = SoftwareVault::new();
        let s = static_key(&mut vault);
        let mut responder = Handshake::responder(&mut vault, s, b"").expect("responder");
        if responder.decode_message1(&inp.message1).is_ok() {
            let _ = responder.encode_message2(&[]);
            let _ = responder.decode_message3(&inp.message3);
        }
        drop(responder);
        assert_eq!(vault.secret_count(), 1);
    }

    // Same for an initiator decoding an arbitrary message 2.
    {
        let mut vault = SoftwareVault::new();
        let s = static_key(&mut vault);
        let mut initiator = Handshake::initiator(&mut vault, s, b"").expect("initiator");
        let _ = initiator.encode_message1(&[]).expect("message 1");
        let _ = initiator.decode_message2(&inp.message2);
        drop(initiator);
        assert_eq!(vault.secret_count(), 1);
    }
});
