//! ecliptix-crypto — Ecliptix protocol cryptographic core
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Secret bytes live exclusively in locked [`secret::SecretBuffer`]s and
//!   are wiped on every exit path.
//! - Ratchet steps are atomic: derivations are staged into fresh buffers
//!   and swapped in only once everything succeeded.
//!
//! # Module layout
//! - `secret`     — locked, wipe-on-drop byte regions; constant-time compare
//! - `primitives` — X25519, Ed25519, HKDF/HMAC-SHA256, AES-256-GCM, CSRNG
//! - `identity`   — identity/pre-key material, public bundles, X3DH
//! - `chain`      — one symmetric chain: message-key derivation and cache
//! - `replay`     — sliding-window (nonce, index) replay protection
//! - `ratchet`    — the Double Ratchet session state machine
//! - `policy`     — adaptive ratchet cadence from observed message load
//! - `kdf`        — Argon2id/BLAKE2b master-key and logout-key derivation
//! - `error`      — unified error type

pub mod chain;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod policy;
pub mod primitives;
pub mod ratchet;
pub mod replay;
pub mod secret;

pub use error::ProtocolError;
pub use secret::SecretBuffer;
