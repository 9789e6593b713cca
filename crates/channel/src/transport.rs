//! Post-handshake transport: length-framed AEAD messages over a blocking
//! reader/writer pair.
//!
//! Frames are `varlen_u14(len) || ciphertext || tag` with empty AAD. Nonces
//! are per-direction counters, never carried on the wire, so both ends must
//! process traffic in order; a dropped or reordered frame shows up as an
//! authentication failure and kills the channel.

use std::io::{Read, Write};

use core_codec::{decode_varlen_u14, encode_frame, MAX_PLAINTEXT, TAG_SIZE};
use core_vault::{SecretHandle, Vault, SHA256_SIZE};

use crate::error::ChannelError;
use crate::handshake::CompletedKeyExchange;

/// An established secure channel.
///
/// Owns the byte-stream capabilities, the vault value, and the two
/// directional key handles produced by the handshake.
pub struct SecureChannel<R, W, V: Vault> {
    vault: V,
    reader: R,
    writer: W,
    encrypt_key: Option<SecretHandle>,
    decrypt_key: Option<SecretHandle>,
    nonce_out: u64,
    nonce_in: u64,
    h: [u8; SHA256_SIZE],
    remote_static_public_key: [u8; 32],
    failed: bool,
}

impl<R: Read, W: Write, V: Vault> SecureChannel<R, W, V> {
    /// Take ownership of the handshake output and wrap the stream.
    pub fn new(reader: R, writer: W, completed: CompletedKeyExchange, vault: V) -> Self {
        SecureChannel {
            vault,
            reader,
            writer,
            encrypt_key: Some(completed.encrypt_key),
            decrypt_key: Some(completed.decrypt_key),
            nonce_out: 0,
            nonce_in: 0,
            h: completed.h,
            remote_static_public_key: completed.remote_static_public_key,
            failed: false,
        }
    }

    /// Final handshake transcript hash; identifies the channel.
    pub fn handshake_hash(&self) -> [u8; SHA256_SIZE] {
        self.h
    }

    /// The peer's authenticated static public key.
    pub fn remote_static_public_key(&self) -> [u8; 32] {
        self.remote_static_public_key
    }

    /// Per-direction counters, mostly interesting to tests and diagnostics.
    pub fn nonces(&self) -> (u64, u64) {
        (self.nonce_out, self.nonce_in)
    }

    /// Encrypt and frame one message. Plaintext is capped at
    /// [`MAX_PLAINTEXT`] bytes; larger payloads must be chunked by the
    /// caller.
    pub fn send(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        self.check_live()?;
        if plaintext.len() > MAX_PLAINTEXT {
            // Not fatal: nothing went on the wire and no nonce was consumed.
            return Err(ChannelError::InvalidArgument("plaintext exceeds frame cap"));
        }
        if self.nonce_out == u64::MAX {
            return Err(self.fail(ChannelError::ResourceExhausted));
        }
        let key = self.encrypt_key.ok_or(ChannelError::State)?;

        let ciphertext = match self
            .vault
            .aead_aes_128_gcm_encrypt(key, self.nonce_out, &[], plaintext)
        {
            Ok(ct) => ct,
            Err(err) => return Err(self.fail(err.into())),
        };
        let frame = match encode_frame(&ciphertext) {
            Ok(frame) => frame,
            Err(err) => return Err(self.fail(err.into())),
        };
        if let Err(err) = self
            .writer
            .write_all(&frame)
            .and_then(|()| self.writer.flush())
        {
            return Err(self.fail(err.into()));
        }
        self.nonce_out += 1;
        Ok(())
    }

    /// Read and decrypt the next message in order.
    pub fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.check_live()?;
        if self.nonce_in == u64::MAX {
            return Err(self.fail(ChannelError::ResourceExhausted));
        }
        let key = self.decrypt_key.ok_or(ChannelError::State)?;

        let body_len = match self.read_frame_len() {
            Ok(len) => len,
            Err(err) => return Err(self.fail(err)),
        };
        if body_len < TAG_SIZE {
            return Err(self.fail(ChannelError::WireFormat("frame shorter than tag")));
        }
        let mut body = vec![0u8; body_len];
        if let Err(err) = self.reader.read_exact(&mut body) {
            return Err(self.fail(err.into()));
        }

        let plaintext = match self
            .vault
            .aead_aes_128_gcm_decrypt(key, self.nonce_in, &[], &body)
        {
            Ok(pt) => pt,
            Err(err) => return Err(self.fail(err.into())),
        };
        self.nonce_in += 1;
        Ok(plaintext)
    }

    /// Destroy both transport keys and consume the channel.
    pub fn close(mut self) -> Result<(), ChannelError> {
        if let Some(key) = self.encrypt_key.take() {
            self.vault.secret_destroy(key)?;
        }
        if let Some(key) = self.decrypt_key.take() {
            self.vault.secret_destroy(key)?;
        }
        Ok(())
    }

    fn read_frame_len(&mut self) -> Result<usize, ChannelError> {
        let mut prefix = [0u8; 2];
        self.reader.read_exact(&mut prefix[..1])?;
        let used = if prefix[0] & 0x80 != 0 {
            self.reader.read_exact(&mut prefix[1..2])?;
            2
        } else {
            1
        };
        let (len, _) = decode_varlen_u14(&prefix[..used])?;
        Ok(len as usize)
    }

    fn check_live(&self) -> Result<(), ChannelError> {
        if self.failed {
            return Err(ChannelError::State);
        }
        Ok(())
    }

    /// Latch the failed state and release both keys; the channel refuses all
    /// further traffic.
    fn fail(&mut self, err: ChannelError) -> ChannelError {
        self.failed = true;
        if let Some(key) = self.encrypt_key.take() {
            let _ = self.vault.secret_destroy(key);
        }
        if let Some(key) = self.decrypt_key.take() {
            let _ = self.vault.secret_destroy(key);
        }
        log::debug!("channel: failed: {}", err);
        err
    }
}

impl<R, W, V: Vault> Drop for SecureChannel<R, W, V> {
    fn drop(&mut self) {
        if let Some(key) = self.encrypt_key.take() {
            let _ = self.vault.secret_destroy(key);
        }
        if let Some(key) = self.decrypt_key.take() {
            let _ = self.vault.secret_destroy(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    use core_vault::SoftwareVault;
    use core_vault::{SecretAttributes, SecretType};

    use crate::handshake::Handshake;

    /// One-directional in-memory byte stream. Reads drain what writes
    /// appended; an empty pipe reads as EOF, which is what a closed peer
    /// looks like.
    #[derive(Clone, Default)]
    struct Pipe(Rc<RefCell<VecDeque<u8>>>);

    impl Pipe {
        fn new() -> Self {
            Pipe::default()
        }

        fn len(&self) -> usize {
            self.0.borrow().len()
        }

        fn peek_front(&self) -> Option<u8> {
            self.0.borrow().front().copied()
        }

        fn drop_front(&self, count: usize) {
            let mut queue = self.0.borrow_mut();
            for _ in 0..count {
                queue.pop_front();
            }
        }
    }

    impl io::Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut queue = self.0.borrow_mut();
            let mut count = 0;
            while count < buf.len() {
                match queue.pop_front() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }
    }

    impl io::Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend(buf.iter().copied());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run a buffer-level handshake and wire two channels up across a pair
    /// of pipes. Returns the pipes too so tests can inspect raw frames.
    fn make_pair<V: Vault>(
        mut vi: V,
        mut vr: V,
    ) -> (
        SecureChannel<Pipe, Pipe, V>,
        SecureChannel<Pipe, Pipe, V>,
        Pipe,
        Pipe,
    ) {
        let si = vi
            .secret_generate(SecretAttributes::persistent(SecretType::X25519))
            .unwrap();
        let sr = vr
            .secret_generate(SecretAttributes::persistent(SecretType::X25519))
            .unwrap();

        let (ci, cr) = {
            let mut initiator = Handshake::initiator(&mut vi, si, b"").unwrap();
            let mut responder = Handshake::responder(&mut vr, sr, b"").unwrap();
            let m1 = initiator.encode_message1(&[]).unwrap();
            responder.decode_message1(&m1).unwrap();
            let m2 = responder.encode_message2(&[]).unwrap();
            initiator.decode_message2(&m2).unwrap();
            let m3 = initiator.encode_message3(&[]).unwrap();
            responder.decode_message3(&m3).unwrap();
            (initiator.finalize().unwrap(), responder.finalize().unwrap())
        };

        let i_to_r = Pipe::new();
        let r_to_i = Pipe::new();
        let initiator_channel =
            SecureChannel::new(r_to_i.clone(), i_to_r.clone(), ci, vi);
        let responder_channel =
            SecureChannel::new(i_to_r.clone(), r_to_i.clone(), cr, vr);
        (initiator_channel, responder_channel, i_to_r, r_to_i)
    }

    #[test]
    fn ping_ack_roundtrip_with_expected_frames() {
        let (mut alice, mut bob, i_to_r, r_to_i) = make_pair(
            SoftwareVault::new(),
            SoftwareVault::new(),
        );

        alice.send(b"PING").unwrap();
        // One frame: 0x14 length prefix, then 4 + 16 bytes of AEAD output.
        assert_eq!(i_to_r.len(), 21);
        assert_eq!(i_to_r.peek_front(), Some(0x14));
        assert_eq!(bob.recv().unwrap(), b"PING");

        bob.send(b"ACK").unwrap();
        assert_eq!(r_to_i.len(), 20);
        assert_eq!(r_to_i.peek_front(), Some(0x13));
        assert_eq!(alice.recv().unwrap(), b"ACK");

        assert_eq!(alice.nonces(), (1, 1));
        assert_eq!(bob.nonces(), (1, 1));
    }

    #[test]
    fn messages_arrive_in_order() {
        let (mut alice, mut bob, _ab, _ba) = make_pair(
            SoftwareVault::new(),
            SoftwareVault::new(),
        );
        for i in 0..32u32 {
            alice.send(&i.to_le_bytes()).unwrap();
        }
        for i in 0..32u32 {
            assert_eq!(bob.recv().unwrap(), i.to_le_bytes());
        }
        assert_eq!(alice.nonces().0, 32);
        assert_eq!(bob.nonces().1, 32);
    }

    #[test]
    fn nonce_counters_strictly_increase() {
        let (mut alice, mut bob, _ab, _ba) = make_pair(
            SoftwareVault::new(),
            SoftwareVault::new(),
        );
        let mut last_out = 0;
        for _ in 0..8 {
            alice.send(b"tick").unwrap();
            let (out, _) = alice.nonces();
            assert!(out > last_out || last_out == 0);
            last_out = out;
            bob.recv().unwrap();
        }
        assert_eq!(alice.nonces().0, 8);
        assert_eq!(bob.nonces().1, 8);
    }

    #[test]
    fn tampered_frame_kills_the_channel() {
        let (mut alice, mut bob, i_to_r, _ba) = make_pair(
            SoftwareVault::new(),
            SoftwareVault::new(),
        );
        alice.send(b"PING").unwrap();
        {
            let mut queue = i_to_r.0.borrow_mut();
            let last = queue.len() - 1;
            queue[last] ^= 0x01;
        }
        assert!(matches!(bob.recv(), Err(ChannelError::Crypto(_))));
        // Latched: both directions refuse further work.
        assert!(matches!(bob.recv(), Err(ChannelError::State)));
        assert!(matches!(bob.send(b"x"), Err(ChannelError::State)));
    }

    #[test]
    fn dropped_frame_breaks_nonce_agreement() {
        let (mut alice, mut bob, i_to_r, _ba) = make_pair(
            SoftwareVault::new(),
            SoftwareVault::new(),
        );
        alice.send(b"first").unwrap();
        let first_frame_len = i_to_r.len();
        alice.send(b"second").unwrap();

        // The transport loses the first frame entirely.
        i_to_r.drop_front(first_frame_len);

        // Bob expects nonce 0 but the frame was sealed with nonce 1.
        assert!(matches!(bob.recv(), Err(ChannelError::Crypto(_))));
        assert!(matches!(bob.recv(), Err(ChannelError::State)));
    }

    #[test]
    fn oversized_send_is_rejected_without_failing_the_channel() {
        let (mut alice, mut bob, _ab, _ba) = make_pair(
            SoftwareVault::new(),
            SoftwareVault::new(),
        );
        let big = vec![0u8; MAX_PLAINTEXT + 1];
        assert!(matches!(
            alice.send(&big),
            Err(ChannelError::InvalidArgument(_))
        ));
        // The channel is still usable and the nonce was not burned.
        assert_eq!(alice.nonces().0, 0);
        alice.send(b"still alive").unwrap();
        assert_eq!(bob.recv().unwrap(), b"still alive");
    }

    #[test]
    fn random_payloads_roundtrip_both_directions() {
        use rand::{rngs::StdRng, RngCore, SeedableRng};

        let (mut alice, mut bob, _ab, _ba) = make_pair(
            SoftwareVault::new(),
            SoftwareVault::new(),
        );
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..40 {
            let mut msg = vec![0u8; (rng.next_u32() as usize) % 2048];
            rng.fill_bytes(&mut msg);
            alice.send(&msg).unwrap();
            assert_eq!(bob.recv().unwrap(), msg);

            let mut reply = vec![0u8; (rng.next_u32() as usize) % 2048];
            rng.fill_bytes(&mut reply);
            bob.send(&reply).unwrap();
            assert_eq!(alice.recv().unwrap(), reply);
        }
    }

    #[test]
    fn max_plaintext_roundtrips() {
        let (mut alice, mut bob, i_to_r, _ba) = make_pair(
            SoftwareVault::new(),
            SoftwareVault::new(),
        );
        let payload = vec![0xA5u8; MAX_PLAINTEXT];
        alice.send(&payload).unwrap();
        // Two prefix bytes plus the 0x3FFF-byte AEAD output.
        assert_eq!(i_to_r.len(), 2 + MAX_PLAINTEXT + TAG_SIZE);
        assert_eq!(bob.recv().unwrap(), payload);
    }

    #[test]
    fn truncated_stream_is_fatal() {
        let (mut alice, mut bob, i_to_r, _ba) = make_pair(
            SoftwareVault::new(),
            SoftwareVault::new(),
        );
        alice.send(b"PING").unwrap();
        // Keep the prefix and half the body.
        i_to_r.0.borrow_mut().truncate(10);
        assert!(matches!(bob.recv(), Err(ChannelError::Io(_))));
        assert!(matches!(bob.recv(), Err(ChannelError::State)));
    }

    #[test]
    fn close_and_drop_release_both_keys() {
        let mut vi = SoftwareVault::new();
        let mut vr = SoftwareVault::new();
        {
            let (alice, bob, _ab, _ba) = make_pair(&mut vi, &mut vr);
            // Static key plus the two transport keys.
            alice.close().unwrap();
            // The drop path covers abandoned channels.
            drop(bob);
        }
        assert_eq!(vi.secret_count(), 1);
        assert_eq!(vr.secret_count(), 1);
    }

    #[test]
    fn failure_also_releases_keys() {
        let mut vi = SoftwareVault::new();
        let mut vr = SoftwareVault::new();
        {
            let (mut alice, mut bob, i_to_r, _ba) = make_pair(&mut vi, &mut vr);
            alice.send(b"PING").unwrap();
            {
                let mut queue = i_to_r.0.borrow_mut();
                let last = queue.len() - 1;
                queue[last] ^= 0x01;
            }
            assert!(bob.recv().is_err());
            alice.close().unwrap();
        }
        assert_eq!(vi.secret_count(), 1);
        assert_eq!(vr.secret_count(), 1);
    }
}
