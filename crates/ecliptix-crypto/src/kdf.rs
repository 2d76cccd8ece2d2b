//! Master-key and logout-key derivation.
//!
//! Master key:
//!   argonSalt  = SHA-256(membership-id ∥ version ∥ "ECLIPTIX_MASTER_KEY")
//!   stretched  = Argon2id(exportKey, argonSalt, 32)
//!   masterKey  = BLAKE2b(message = stretched, salt = "ECLIPTIX_MSTR_V1",
//!                        personal = membership-id, 32)
//! The binding hash is UNKEYED; the stretched secret is the hashed message.
//!
//! Sub-seeds for the Ed25519 identity, X25519 identity and signed pre-key
//! are keyed BLAKE2b: key = masterKey, message = version ∥ context-string ∥
//! membership-id.
//!
//! Logout keys: HKDF-Expand of the master key under fixed info strings;
//! tags verify in constant time.
//!
//! Membership ids must be exactly 16 bytes — inputs of any other length are
//! rejected, never truncated or padded.

use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::ProtocolError;
use crate::primitives::{self, SHA256_LEN};
use crate::secret::SecretBuffer;

/// Fixed BLAKE2b salt for the master-key binding (exactly 16 bytes).
const MASTER_KEY_SALT: &[u8; 16] = b"ECLIPTIX_MSTR_V1";

/// Domain-separation context mixed into the Argon2 salt.
const MASTER_KEY_CONTEXT: &[u8] = b"ECLIPTIX_MASTER_KEY";

const INFO_LOGOUT_HMAC: &[u8] = b"ecliptix-logout-hmac-v1";
const INFO_LOGOUT_PROOF: &[u8] = b"ecliptix-logout-proof-v1";

/// A membership identifier, exactly 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipId([u8; 16]);

impl MembershipId {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl TryFrom<&[u8]> for MembershipId {
    type Error = ProtocolError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| ProtocolError::InvalidInput(format!(
                "membership id must be exactly 16 bytes, got {}",
                bytes.len()
            )))
    }
}

/// Argon2id cost profile for the export-key stretch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StretchProfile {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl StretchProfile {
    /// Protocol defaults: 256 MiB, 4 iterations, parallelism 4.
    pub fn standard() -> Self {
        Self {
            memory_kib: 256 * 1024,
            iterations: 4,
            parallelism: 4,
        }
    }

    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }

    fn params(&self) -> Result<Params, ProtocolError> {
        Params::new(self.memory_kib, self.iterations, self.parallelism, Some(32))
            .map_err(|e| ProtocolError::InvalidInput(format!("argon2 parameters: {e}")))
    }
}

impl Default for StretchProfile {
    fn default() -> Self {
        Self::standard()
    }
}

/// Stretch and bind an export key into the 32-byte master key.
pub fn derive_master_key(
    export_key: &SecretBuffer,
    membership_id: &MembershipId,
    version: u32,
    profile: &StretchProfile,
) -> Result<SecretBuffer, ProtocolError> {
    let salt: [u8; SHA256_LEN] = primitives::sha256_parts(&[
        membership_id.as_bytes(),
        &version.to_be_bytes(),
        MASTER_KEY_CONTEXT,
    ]);

    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, profile.params()?);
    let mut stretched = SecretBuffer::zeroed(32)?;
    argon
        .hash_password_into(export_key.read(), &salt, stretched.write())
        .map_err(|e| ProtocolError::CryptoInternal(format!("argon2id: {e}")))?;

    // Unkeyed BLAKE2b-personal over the stretched secret.
    let hash = blake2b_simd::Params::new()
        .hash_length(32)
        .salt(MASTER_KEY_SALT)
        .personal(membership_id.as_bytes())
        .hash(stretched.read());
    SecretBuffer::from_slice(hash.as_bytes())
}

/// Sub-seed contexts for identity-key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubSeedContext {
    Ed25519,
    X25519,
    SignedPreKey,
}

impl SubSeedContext {
    fn as_bytes(&self) -> &'static [u8] {
        match self {
            SubSeedContext::Ed25519 => b"ED25519",
            SubSeedContext::X25519 => b"X25519",
            SubSeedContext::SignedPreKey => b"SPK_X25519",
        }
    }
}

/// Keyed-BLAKE2b sub-seed: BLAKE2b(key = master, version ∥ context ∥ id).
pub fn derive_sub_seed(
    master_key: &SecretBuffer,
    membership_id: &MembershipId,
    version: u32,
    context: SubSeedContext,
) -> Result<SecretBuffer, ProtocolError> {
    let mut state = blake2b_simd::Params::new()
        .hash_length(32)
        .key(master_key.read())
        .to_state();
    state.update(&version.to_be_bytes());
    state.update(context.as_bytes());
    state.update(membership_id.as_bytes());
    SecretBuffer::from_slice(state.finalize().as_bytes())
}

// ── Logout key derivation ────────────────────────────────────────────────────

/// HMAC key authenticating a logout request.
pub fn derive_logout_hmac_key(master_key: &SecretBuffer) -> Result<SecretBuffer, ProtocolError> {
    primitives::hkdf_expand(master_key, INFO_LOGOUT_HMAC, 32)
}

/// Key for the server-held logout proof.
pub fn derive_logout_proof_key(master_key: &SecretBuffer) -> Result<SecretBuffer, ProtocolError> {
    primitives::hkdf_expand(master_key, INFO_LOGOUT_PROOF, 32)
}

/// HMAC-SHA256 tag over a logout payload.
pub fn logout_tag(
    key: &SecretBuffer,
    payload: &[u8],
) -> Result<[u8; SHA256_LEN], ProtocolError> {
    primitives::hmac_sha256(key.read(), payload)
}

/// Constant-time verification of a logout tag.
pub fn verify_logout_tag(
    key: &SecretBuffer,
    payload: &[u8],
    tag: &[u8],
) -> Result<bool, ProtocolError> {
    primitives::hmac_verify(key.read(), payload, tag)
}
