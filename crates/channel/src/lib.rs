//! Noise XX secure channel over blocking byte streams.
//!
//! Two peers run the three-message XX handshake through a [`core_vault::Vault`],
//! derive a pair of directional AES-128-GCM keys, and exchange length-framed
//! encrypted messages over any `Read`/`Write` capability pair. Secret material
//! stays inside the vault for the whole exchange; this crate only ever holds
//! handles.
//!
//! The buffer-level API ([`Handshake`]) is bit-exact with the XX message
//! formats; [`establish_initiator`]/[`establish_responder`] drive a complete
//! exchange over a stream and hand back a ready [`SecureChannel`].

#![forbid(unsafe_code)]

mod error;
mod handshake;
mod symmetric;
mod transport;

pub use error::ChannelError;
pub use handshake::{
    establish_initiator, establish_responder, CompletedKeyExchange, Handshake, Role,
};
pub use transport::SecureChannel;

/// Protocol instantiation name, mixed into the transcript by both peers.
pub const PROTOCOL_NAME: &[u8; 28] = b"Noise_XX_25519_AESGCM_SHA256";
