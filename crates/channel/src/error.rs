use std::io;

use core_codec::CodecError;
use core_vault::VaultError;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Caller passed something malformed: oversized payload, wrong-sized key.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Bytes on the wire do not form a valid frame or handshake message.
    #[error("wire format error: {0}")]
    WireFormat(&'static str),
    /// AEAD tag mismatch, ECDH failure, or any vault primitive failure.
    #[error("crypto failure")]
    Crypto(#[source] VaultError),
    /// Operation invoked in the wrong handshake step or on a failed channel.
    #[error("operation invalid in current state")]
    State,
    /// Nonce counter exhausted.
    #[error("channel resources exhausted")]
    ResourceExhausted,
    #[error("io error")]
    Io(#[from] io::Error),
}

impl From<VaultError> for ChannelError {
    fn from(err: VaultError) -> Self {
        ChannelError::Crypto(err)
    }
}

impl From<CodecError> for ChannelError {
    fn from(err: CodecError) -> Self {
        ChannelError::WireFormat(match err {
            CodecError::LengthOverflow => "length prefix overflow",
            CodecError::Truncated => "truncated frame",
            CodecError::Invalid => "malformed length prefix",
        })
    }
}
