//! ecliptix-proto — wire records, envelope codec, protocol facade
//!
//! # Module layout
//! - `wire`     — little-endian, length-prefixed framing primitives
//! - `bundle`   — `PublicBundle` / `PubKeyExchange` wire codecs
//! - `envelope` — `SecureEnvelope` / `EnvelopeMetadata` wire codecs
//! - `codec`    — envelope production and consumption over a session
//! - `system`   — `ProtocolSystem`: handshake, envelopes, events, teardown
//!
//! The cryptographic state machine itself lives in `ecliptix-crypto`; this
//! crate gives it a wire surface and a facade.

pub mod bundle;
pub mod codec;
pub mod envelope;
pub mod system;
pub mod wire;

pub use bundle::{ExchangeState, PubKeyExchange};
pub use envelope::{EnvelopeMetadata, SecureEnvelope};
pub use system::{ConfigMode, ProtocolEventHandler, ProtocolObserver, ProtocolSystem};
