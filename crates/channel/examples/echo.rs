//! Two-thread echo demo: a responder listens on loopback, an initiator
//! connects, both run the XX handshake and trade a few encrypted messages.

use std::net::{TcpListener, TcpStream};
use std::thread;

use channel::{establish_initiator, establish_responder, ChannelError};
use core_vault::{SecretAttributes, SecretType, SoftwareVault, Vault};

fn main() -> Result<(), ChannelError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let responder = thread::spawn(move || -> Result<(), ChannelError> {
        let (stream, peer) = listener.accept()?;
        println!("responder: connection from {}", peer);

        let mut vault = SoftwareVault::new();
        let static_key = vault.secret_generate(SecretAttributes::persistent(SecretType::X25519))?;
        let mut chan = establish_responder(
            &mut vault,
            stream.try_clone()?,
            stream,
            static_key,
            b"",
        )?;
        println!(
            "responder: channel up, peer static {}",
            hex::encode(chan.remote_static_public_key())
        );

        loop {
            let msg = chan.recv()?;
            if msg == b"BYE" {
                break;
            }
            println!(
                "responder: echoing {} bytes: {:?}",
                msg.len(),
                String::from_utf8_lossy(&msg)
            );
            chan.send(&msg)?;
        }
        chan.close()
    });

    let stream = TcpStream::connect(addr)?;
    let mut vault = SoftwareVault::new();
    let static_key = vault.secret_generate(SecretAttributes::persistent(SecretType::X25519))?;
    let mut chan = establish_initiator(
        &mut vault,
        stream.try_clone()?,
        stream,
        static_key,
        b"",
    )?;
    println!(
        "initiator: channel up, h = {}",
        hex::encode(chan.handshake_hash())
    );

    for msg in [&b"PING"[..], b"hello over the secure channel"] {
        chan.send(msg)?;
        let echoed = chan.recv()?;
        assert_eq!(echoed, msg);
        println!("initiator: got echo of {:?}", String::from_utf8_lossy(&echoed));
    }
    chan.send(b"BYE")?;
    chan.close()?;

    responder.join().expect("responder thread")?;
    println!("done");
    Ok(())
}
