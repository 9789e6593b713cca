//! XX handshake state machine.
//!
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! Message formats are bit-exact:
//!
//! * message 1: `e_pub(32) || payload`
//! * message 2: `e_pub(32) || (rs_pub || tag)(48) || (payload || tag)`
//! * message 3: `(s_pub || tag)(48) || (payload || tag)`
//!
//! Any failure destroys every secret the handshake owns and parks the state
//! machine; handshake errors are fatal for the channel, there is no retry.

use std::io::{Read, Write};

use core_codec::{decode_varlen_u14, encode_varlen_u14, MAX_PLAINTEXT, TAG_SIZE};
use core_vault::{SecretAttributes, SecretHandle, SecretType, Vault, SHA256_SIZE, X25519_KEY_SIZE};

use crate::error::ChannelError;
use crate::symmetric::SymmetricState;
use crate::transport::SecureChannel;
use crate::PROTOCOL_NAME;

const PUBLIC_KEY_SIZE: usize = X25519_KEY_SIZE;
const ENCRYPTED_KEY_SIZE: usize = PUBLIC_KEY_SIZE + TAG_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Message1,
    Message2,
    Message3,
    Split,
    Done,
    Failed,
}

/// Output of a finished handshake. Owns the two directional key handles until
/// they are handed to a [`SecureChannel`].
pub struct CompletedKeyExchange {
    pub(crate) h: [u8; SHA256_SIZE],
    pub(crate) encrypt_key: SecretHandle,
    pub(crate) decrypt_key: SecretHandle,
    pub(crate) remote_static_public_key: [u8; PUBLIC_KEY_SIZE],
}

impl CompletedKeyExchange {
    /// Final transcript hash; identifies the channel, carries no secret.
    pub fn handshake_hash(&self) -> [u8; SHA256_SIZE] {
        self.h
    }

    pub fn encrypt_key(&self) -> SecretHandle {
        self.encrypt_key
    }

    pub fn decrypt_key(&self) -> SecretHandle {
        self.decrypt_key
    }

    /// The peer's authenticated static public key.
    pub fn remote_static_public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.remote_static_public_key
    }
}

/// One side of an XX key agreement.
///
/// The handshake owns its vault value for the duration of the exchange; pass
/// `&mut vault` to keep ownership at the call site. The caller-supplied
/// static key is borrowed, never destroyed.
pub struct Handshake<V: Vault> {
    vault: V,
    symm: SymmetricState,
    role: Role,
    step: Step,
    s: SecretHandle,
    e: Option<SecretHandle>,
    re: Option<[u8; PUBLIC_KEY_SIZE]>,
    rs: Option<[u8; PUBLIC_KEY_SIZE]>,
}

impl<V: Vault> Handshake<V> {
    pub fn initiator(
        vault: V,
        static_key: SecretHandle,
        prologue: &[u8],
    ) -> Result<Self, ChannelError> {
        Self::new(vault, static_key, None, prologue, Role::Initiator)
    }

    pub fn responder(
        vault: V,
        static_key: SecretHandle,
        prologue: &[u8],
    ) -> Result<Self, ChannelError> {
        Self::new(vault, static_key, None, prologue, Role::Responder)
    }

    /// Like [`Handshake::initiator`] but with a caller-imported ephemeral,
    /// for deterministic exchanges and known-answer tests. The handshake
    /// takes ownership of the ephemeral handle.
    pub fn initiator_with_ephemeral(
        vault: V,
        static_key: SecretHandle,
        ephemeral: SecretHandle,
        prologue: &[u8],
    ) -> Result<Self, ChannelError> {
        Self::new(vault, static_key, Some(ephemeral), prologue, Role::Initiator)
    }

    /// Responder counterpart of [`Handshake::initiator_with_ephemeral`].
    pub fn responder_with_ephemeral(
        vault: V,
        static_key: SecretHandle,
        ephemeral: SecretHandle,
        prologue: &[u8],
    ) -> Result<Self, ChannelError> {
        Self::new(vault, static_key, Some(ephemeral), prologue, Role::Responder)
    }

    fn new(
        mut vault: V,
        static_key: SecretHandle,
        ephemeral: Option<SecretHandle>,
        prologue: &[u8],
        role: Role,
    ) -> Result<Self, ChannelError> {
        let e = match ephemeral {
            Some(e) => e,
            None => vault.secret_generate(SecretAttributes::ephemeral(SecretType::X25519))?,
        };
        let mut symm = match SymmetricState::initialize(&mut vault, PROTOCOL_NAME) {
            Ok(symm) => symm,
            Err(err) => {
                let _ = vault.secret_destroy(e);
                return Err(err);
            }
        };
        if let Err(err) = symm.mix_hash(&mut vault, prologue) {
            symm.destroy(&mut vault);
            let _ = vault.secret_destroy(e);
            return Err(err);
        }
        Ok(Handshake {
            vault,
            symm,
            role,
            step: Step::Message1,
            s: static_key,
            e: Some(e),
            re: None,
            rs: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// `-> e` plus the (cleartext) first payload.
    pub fn encode_message1(&mut self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.expect(Role::Initiator, Step::Message1)?;
        match self.message1_out(payload) {
            Ok(wire) => {
                self.step = Step::Message2;
                Ok(wire)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Responder side of message 1.
    pub fn decode_message1(&mut self, wire: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.expect(Role::Responder, Step::Message1)?;
        match self.message1_in(wire) {
            Ok(payload) => {
                self.step = Step::Message2;
                Ok(payload)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// `<- e, ee, s, es` plus the first encrypted payload.
    pub fn encode_message2(&mut self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.expect(Role::Responder, Step::Message2)?;
        match self.message2_out(payload) {
            Ok(wire) => {
                self.step = Step::Message3;
                Ok(wire)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Initiator side of message 2; authenticates the responder.
    pub fn decode_message2(&mut self, wire: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.expect(Role::Initiator, Step::Message2)?;
        match self.message2_in(wire) {
            Ok(payload) => {
                self.step = Step::Message3;
                Ok(payload)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// `-> s, se` plus the final encrypted payload.
    pub fn encode_message3(&mut self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.expect(Role::Initiator, Step::Message3)?;
        match self.message3_out(payload) {
            Ok(wire) => {
                self.step = Step::Split;
                Ok(wire)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Responder side of message 3; authenticates the initiator.
    pub fn decode_message3(&mut self, wire: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.expect(Role::Responder, Step::Message3)?;
        match self.message3_in(wire) {
            Ok(payload) => {
                self.step = Step::Split;
                Ok(payload)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Split the chaining key into the two directional transport keys.
    ///
    /// Both sides derive the same pair; the labels swap so that the sender
    /// key on one end is the receiver key on the other.
    pub fn finalize(&mut self) -> Result<CompletedKeyExchange, ChannelError> {
        if self.step != Step::Split {
            if self.step == Step::Failed {
                return Err(ChannelError::State);
            }
            return Err(self.fail(ChannelError::State));
        }
        match self.split() {
            Ok(completed) => {
                self.step = Step::Done;
                log::debug!(
                    "handshake: {:?} complete, h={:02x?}...",
                    self.role,
                    &completed.h[..4]
                );
                Ok(completed)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn message1_out(&mut self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        check_payload_len(payload)?;
        let e_pub = self.vault.secret_publickey_get(self.e()?)?;
        self.symm.mix_hash(&mut self.vault, &e_pub)?;
        let payload_ct = self.symm.encrypt_and_hash(&mut self.vault, payload)?;

        let mut wire = Vec::with_capacity(PUBLIC_KEY_SIZE + payload_ct.len());
        wire.extend_from_slice(&e_pub);
        wire.extend_from_slice(&payload_ct);
        Ok(wire)
    }

    fn message1_in(&mut self, wire: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if wire.len() < PUBLIC_KEY_SIZE {
            return Err(ChannelError::WireFormat("message 1 shorter than e"));
        }
        let (re, payload_ct) = wire.split_at(PUBLIC_KEY_SIZE);
        let re = read_key(re)?;
        self.symm.mix_hash(&mut self.vault, &re)?;
        self.re = Some(re);

        self.symm.decrypt_and_hash(&mut self.vault, payload_ct)
    }

    fn message2_out(&mut self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        check_payload_len(payload)?;
        let re = self.re()?;

        // e
        let e_pub = self.vault.secret_publickey_get(self.e()?)?;
        self.symm.mix_hash(&mut self.vault, &e_pub)?;
        let mut wire = Vec::with_capacity(
            PUBLIC_KEY_SIZE + ENCRYPTED_KEY_SIZE + payload.len() + TAG_SIZE,
        );
        wire.extend_from_slice(&e_pub);

        // ee
        let dh = self.vault.ecdh(self.e()?, &re)?;
        self.symm.mix_key(&mut self.vault, dh)?;

        // s
        let s_pub = self.vault.secret_publickey_get(self.s)?;
        let s_pub_ct = self.symm.encrypt_and_hash(&mut self.vault, &s_pub)?;
        wire.extend_from_slice(&s_pub_ct);

        // es
        let dh = self.vault.ecdh(self.s, &re)?;
        self.symm.mix_key(&mut self.vault, dh)?;

        let payload_ct = self.symm.encrypt_and_hash(&mut self.vault, payload)?;
        wire.extend_from_slice(&payload_ct);
        Ok(wire)
    }

    fn message2_in(&mut self, wire: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if wire.len() < PUBLIC_KEY_SIZE + ENCRYPTED_KEY_SIZE + TAG_SIZE {
            return Err(ChannelError::WireFormat("message 2 shorter than e, s"));
        }
        // e
        let (re, rest) = wire.split_at(PUBLIC_KEY_SIZE);
        let re = read_key(re)?;
        self.symm.mix_hash(&mut self.vault, &re)?;
        self.re = Some(re);

        // ee
        let dh = self.vault.ecdh(self.e()?, &re)?;
        self.symm.mix_key(&mut self.vault, dh)?;

        // s
        let (s_pub_ct, payload_ct) = rest.split_at(ENCRYPTED_KEY_SIZE);
        let rs_bytes = self.symm.decrypt_and_hash(&mut self.vault, s_pub_ct)?;
        let rs = read_key(&rs_bytes)?;
        self.rs = Some(rs);

        // es
        let dh = self.vault.ecdh(self.e()?, &rs)?;
        self.symm.mix_key(&mut self.vault, dh)?;

        self.symm.decrypt_and_hash(&mut self.vault, payload_ct)
    }

    fn message3_out(&mut self, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        check_payload_len(payload)?;
        let re = self.re()?;

        // s
        let s_pub = self.vault.secret_publickey_get(self.s)?;
        let mut wire = self.symm.encrypt_and_hash(&mut self.vault, &s_pub)?;
        wire.reserve(payload.len() + TAG_SIZE);

        // se
        let dh = self.vault.ecdh(self.s, &re)?;
        self.symm.mix_key(&mut self.vault, dh)?;

        let payload_ct = self.symm.encrypt_and_hash(&mut self.vault, payload)?;
        wire.extend_from_slice(&payload_ct);
        Ok(wire)
    }

    fn message3_in(&mut self, wire: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if wire.len() < ENCRYPTED_KEY_SIZE + TAG_SIZE {
            return Err(ChannelError::WireFormat("message 3 shorter than s"));
        }
        // s
        let (s_pub_ct, payload_ct) = wire.split_at(ENCRYPTED_KEY_SIZE);
        let rs_bytes = self.symm.decrypt_and_hash(&mut self.vault, s_pub_ct)?;
        let rs = read_key(&rs_bytes)?;
        self.rs = Some(rs);

        // se
        let dh = self.vault.ecdh(self.e()?, &rs)?;
        self.symm.mix_key(&mut self.vault, dh)?;

        self.symm.decrypt_and_hash(&mut self.vault, payload_ct)
    }

    fn split(&mut self) -> Result<CompletedKeyExchange, ChannelError> {
        let h = self.symm.handshake_hash();
        let rs = self.rs.ok_or(ChannelError::State)?;
        let (k1, k2) = self.symm.split(&mut self.vault)?;
        let (encrypt_key, decrypt_key) = match self.role {
            Role::Initiator => (k1, k2),
            Role::Responder => (k2, k1),
        };
        if let Some(e) = self.e.take() {
            self.vault.secret_destroy(e)?;
        }
        Ok(CompletedKeyExchange {
            h,
            encrypt_key,
            decrypt_key,
            remote_static_public_key: rs,
        })
    }

    fn expect(&mut self, role: Role, step: Step) -> Result<(), ChannelError> {
        if self.role == role && self.step == step {
            return Ok(());
        }
        if self.step == Step::Failed {
            return Err(ChannelError::State);
        }
        // Out-of-order invocation is fatal, like any other handshake failure.
        Err(self.fail(ChannelError::State))
    }

    /// Destroy everything this handshake owns and latch the failed state.
    fn fail(&mut self, err: ChannelError) -> ChannelError {
        self.symm.destroy(&mut self.vault);
        if let Some(e) = self.e.take() {
            let _ = self.vault.secret_destroy(e);
        }
        self.step = Step::Failed;
        log::debug!("handshake: {:?} failed: {}", self.role, err);
        err
    }

    fn e(&self) -> Result<SecretHandle, ChannelError> {
        self.e.ok_or(ChannelError::State)
    }

    fn re(&self) -> Result<[u8; PUBLIC_KEY_SIZE], ChannelError> {
        self.re.ok_or(ChannelError::State)
    }
}

impl<V: Vault> Drop for Handshake<V> {
    fn drop(&mut self) {
        // Abandoned mid-flight: release whatever is still live. After a
        // successful finalize both options are already empty.
        self.symm.destroy(&mut self.vault);
        if let Some(e) = self.e.take() {
            let _ = self.vault.secret_destroy(e);
        }
    }
}

fn check_payload_len(payload: &[u8]) -> Result<(), ChannelError> {
    if payload.len() > MAX_PLAINTEXT {
        return Err(ChannelError::InvalidArgument("handshake payload too large"));
    }
    Ok(())
}

fn read_key(bytes: &[u8]) -> Result<[u8; PUBLIC_KEY_SIZE], ChannelError> {
    if bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChannelError::WireFormat("bad public key length"));
    }
    let mut key = [0u8; PUBLIC_KEY_SIZE];
    key.copy_from_slice(bytes);
    Ok(key)
}

// Fixed-size prefix of each message; everything after it is the payload
// field, which gets a varlen length prefix on the stream so the messages
// self-delimit without transport framing.
fn fixed_len(role: Role, message: u8) -> usize {
    match (role, message) {
        (Role::Initiator, 1) => PUBLIC_KEY_SIZE,
        (Role::Responder, 2) => PUBLIC_KEY_SIZE + ENCRYPTED_KEY_SIZE,
        (Role::Initiator, 3) => ENCRYPTED_KEY_SIZE,
        _ => unreachable!("no such handshake message"),
    }
}

fn write_message<W: Write>(writer: &mut W, wire: &[u8], fixed: usize) -> Result<(), ChannelError> {
    let payload = &wire[fixed..];
    let mut prefix = bytes::BytesMut::with_capacity(2);
    encode_varlen_u14(payload.len() as u16, &mut prefix)?;
    writer.write_all(&wire[..fixed])?;
    writer.write_all(&prefix)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn read_message<R: Read>(reader: &mut R, fixed: usize) -> Result<Vec<u8>, ChannelError> {
    let mut wire = vec![0u8; fixed];
    reader.read_exact(&mut wire)?;

    let mut prefix = [0u8; 2];
    reader.read_exact(&mut prefix[..1])?;
    let used = if prefix[0] & 0x80 != 0 {
        reader.read_exact(&mut prefix[1..2])?;
        2
    } else {
        1
    };
    let (payload_len, _) = decode_varlen_u14(&prefix[..used])?;

    let start = wire.len();
    wire.resize(start + payload_len as usize, 0);
    reader.read_exact(&mut wire[start..])?;
    Ok(wire)
}

/// Run the full initiator exchange over a blocking stream and wrap the
/// result in a [`SecureChannel`]. Handshake payloads are empty.
pub fn establish_initiator<R, W, V>(
    mut vault: V,
    mut reader: R,
    mut writer: W,
    static_key: SecretHandle,
    prologue: &[u8],
) -> Result<SecureChannel<R, W, V>, ChannelError>
where
    R: Read,
    W: Write,
    V: Vault,
{
    let completed = {
        let mut handshake = Handshake::initiator(&mut vault, static_key, prologue)?;
        let m1 = handshake.encode_message1(&[])?;
        write_message(&mut writer, &m1, fixed_len(Role::Initiator, 1))?;

        let m2 = read_message(&mut reader, fixed_len(Role::Responder, 2))?;
        handshake.decode_message2(&m2)?;

        let m3 = handshake.encode_message3(&[])?;
        write_message(&mut writer, &m3, fixed_len(Role::Initiator, 3))?;
        handshake.finalize()?
    };
    Ok(SecureChannel::new(reader, writer, completed, vault))
}

/// Responder counterpart of [`establish_initiator`].
pub fn establish_responder<R, W, V>(
    mut vault: V,
    mut reader: R,
    mut writer: W,
    static_key: SecretHandle,
    prologue: &[u8],
) -> Result<SecureChannel<R, W, V>, ChannelError>
where
    R: Read,
    W: Write,
    V: Vault,
{
    let completed = {
        let mut handshake = Handshake::responder(&mut vault, static_key, prologue)?;
        let m1 = read_message(&mut reader, fixed_len(Role::Initiator, 1))?;
        handshake.decode_message1(&m1)?;

        let m2 = handshake.encode_message2(&[])?;
        write_message(&mut writer, &m2, fixed_len(Role::Responder, 2))?;

        let m3 = read_message(&mut reader, fixed_len(Role::Initiator, 3))?;
        handshake.decode_message3(&m3)?;
        handshake.finalize()?
    };
    Ok(SecureChannel::new(reader, writer, completed, vault))
}
