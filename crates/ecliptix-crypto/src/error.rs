use thiserror::Error;

/// Unified error type for the protocol core.
///
/// Handshake errors are fatal to the session. Per-message errors (auth
/// failure, replay, index bounds) are fatal to that message only.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("metadata authentication failed (AES-GCM tag mismatch)")]
    MetadataAuthFailed,

    #[error("payload authentication failed (AES-GCM tag mismatch)")]
    PayloadAuthFailed,

    #[error("replayed message: (nonce, index) already consumed or below window")]
    Replay,

    #[error("message index {0} is in the past and no longer cached")]
    IndexInPast(u32),

    #[error("message index {requested} too far ahead of current index {current}")]
    IndexTooFarAhead { requested: u32, current: u32 },

    #[error("no cached message key at index {0}")]
    UnknownKeyIndex(u32),

    #[error("session is terminated")]
    Terminated,

    #[error("crypto primitive failure: {0}")]
    CryptoInternal(String),

    #[error("secret allocation failed")]
    ResourceExhausted,
}

impl From<hkdf::InvalidLength> for ProtocolError {
    fn from(e: hkdf::InvalidLength) -> Self {
        ProtocolError::CryptoInternal(format!("hkdf output length: {e}"))
    }
}

impl From<hkdf::InvalidPrkLength> for ProtocolError {
    fn from(e: hkdf::InvalidPrkLength) -> Self {
        ProtocolError::CryptoInternal(format!("hkdf prk length: {e}"))
    }
}
