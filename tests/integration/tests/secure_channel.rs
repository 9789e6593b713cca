//! End-to-end secure channel runs over TCP loopback.
//!
//! Each side lives on its own thread with its own vault, mirroring how the
//! two ends of a real connection never share state beyond the wire.

use std::net::{TcpListener, TcpStream};
use std::thread;

use channel::{establish_initiator, establish_responder};
use core_vault::Vault;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use secure_channel_tests::vault_with_static_key;

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let client = thread::spawn(move || TcpStream::connect(addr).expect("connect"));
    let (server, _) = listener.accept().expect("accept");
    (client.join().expect("client thread"), server)
}

#[test]
fn ping_ack_over_tcp() {
    let (client, server) = tcp_pair();

    let responder = thread::spawn(move || {
        let (mut vault, static_key) = vault_with_static_key();
        let mut chan = establish_responder(
            &mut vault,
            server.try_clone().expect("clone"),
            server,
            static_key,
            b"",
        )
        .expect("responder establish");

        assert_eq!(chan.recv().expect("recv ping"), b"PING");
        chan.send(b"ACK").expect("send ack");
        chan.close().expect("close");
        // Only the static key survives the channel.
        assert_eq!(vault.secret_count(), 1);
    });

    let (mut vault, static_key) = vault_with_static_key();
    let mut chan = establish_initiator(
        &mut vault,
        client.try_clone().expect("clone"),
        client,
        static_key,
        b"",
    )
    .expect("initiator establish");

    chan.send(b"PING").expect("send ping");
    assert_eq!(chan.recv().expect("recv ack"), b"ACK");
    chan.close().expect("close");
    assert_eq!(vault.secret_count(), 1);

    responder.join().expect("responder thread");
}

#[test]
fn both_sides_agree_on_transcript_and_identity() {
    let (client, server) = tcp_pair();

    // The responder's static public key is known ahead of time so the
    // initiator can check who it authenticated.
    let (mut responder_vault, responder_static) = vault_with_static_key();
    let responder_static_pub = responder_vault
        .secret_publickey_get(responder_static)
        .expect("responder pub");

    let responder = thread::spawn(move || {
        let chan = establish_responder(
            &mut responder_vault,
            server.try_clone().expect("clone"),
            server,
            responder_static,
            b"",
        )
        .expect("responder establish");
        let h = chan.handshake_hash();
        let initiator_pub = chan.remote_static_public_key();
        chan.close().expect("close");
        (h, initiator_pub)
    });

    let (mut vault, static_key) = vault_with_static_key();
    let initiator_static_pub = vault.secret_publickey_get(static_key).expect("pub");
    let chan = establish_initiator(
        &mut vault,
        client.try_clone().expect("clone"),
        client,
        static_key,
        b"",
    )
    .expect("initiator establish");

    let (responder_h, seen_initiator_pub) = responder.join().expect("responder thread");
    assert_eq!(chan.handshake_hash(), responder_h);
    assert_eq!(chan.remote_static_public_key(), responder_static_pub);
    assert_eq!(seen_initiator_pub, initiator_static_pub);
    chan.close().expect("close");
}

#[test]
fn bulk_traffic_in_both_directions() {
    let (client, server) = tcp_pair();

    let responder = thread::spawn(move || {
        let (mut vault, static_key) = vault_with_static_key();
        let mut chan = establish_responder(
            &mut vault,
            server.try_clone().expect("clone"),
            server,
            static_key,
            b"",
        )
        .expect("responder establish");

        // Echo until the sentinel arrives.
        loop {
            let msg = chan.recv().expect("recv");
            if msg == b"DONE" {
                break;
            }
            chan.send(&msg).expect("echo");
        }
        chan.close().expect("close");
    });

    let (mut vault, static_key) = vault_with_static_key();
    let mut chan = establish_initiator(
        &mut vault,
        client.try_clone().expect("clone"),
        client,
        static_key,
        b"",
    )
    .expect("initiator establish");

    let mut rng = StdRng::seed_from_u64(2024);
    for round in 0..64 {
        // Sizes from empty up to the frame cap.
        let len = if round == 0 {
            0
        } else if round == 1 {
            core_codec::MAX_PLAINTEXT
        } else {
            (rng.next_u32() as usize) % 4096
        };
        let mut msg = vec![0u8; len];
        rng.fill_bytes(&mut msg);
        chan.send(&msg).expect("send");
        assert_eq!(chan.recv().expect("recv echo"), msg);
    }
    let (nonce_out, nonce_in) = chan.nonces();
    assert_eq!(nonce_out, 64);
    assert_eq!(nonce_in, 64);

    chan.send(b"DONE").expect("send done");
    chan.close().expect("close");
    responder.join().expect("responder thread");
}

#[test]
fn mismatched_prologues_refuse_to_establish() {
    let (client, server) = tcp_pair();

    let responder = thread::spawn(move || {
        let (mut vault, static_key) = vault_with_static_key();
        let failed = establish_responder(
            &mut vault,
            server.try_clone().expect("clone"),
            server,
            static_key,
            b"network-a",
        )
        .is_err();
        // Whatever happened, the handshake left no secrets behind.
        assert_eq!(vault.secret_count(), 1);
        failed
    });

    let (mut vault, static_key) = vault_with_static_key();
    // The initiator is the first to notice: message 2 fails to decrypt.
    assert!(establish_initiator(
        &mut vault,
        client.try_clone().expect("clone"),
        client,
        static_key,
        b"network-b",
    )
    .is_err());
    assert_eq!(vault.secret_count(), 1);

    // The responder either errors (initiator hung up) or never completes
    // message 3; both count as refusal. The thread result only matters in
    // that it must not panic.
    let _ = responder.join().expect("responder thread");
}
