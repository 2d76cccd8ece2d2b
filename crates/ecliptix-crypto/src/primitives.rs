//! Cryptographic primitives.
//!
//! NO custom crypto; every operation delegates to an audited RustCrypto or
//! dalek crate. This module is also where thrown AEAD failures become plain
//! results: callers map the opaque [`AeadFailure`] into the metadata- or
//! payload-auth error appropriate to their record.
//!
//! Protocol constants (sizes and HKDF info strings) are fixed here and MUST
//! stay byte-identical across implementations.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::ProtocolError;
use crate::secret::SecretBuffer;

pub const X25519_KEY_LEN: usize = 32;
pub const ED25519_PUBLIC_LEN: usize = 32;
pub const ED25519_SIGNATURE_LEN: usize = 64;
pub const AES_KEY_LEN: usize = 32;
pub const AES_NONCE_LEN: usize = 12;
pub const AES_TAG_LEN: usize = 16;
pub const SHA256_LEN: usize = 32;

/// HKDF info strings — wire-compatibility constants.
pub const INFO_MESSAGE_KEY: &[u8] = b"msg";
pub const INFO_CHAIN_KEY: &[u8] = b"chain";
pub const INFO_RATCHET: &[u8] = b"ratchet";
pub const INFO_METADATA: &[u8] = b"metadata";
pub const INFO_NONCE_PREFIX: &[u8] = b"nonce-prefix";
pub const INFO_X3DH: &[u8] = b"ecliptix-x3dh-v1";

type HmacSha256 = Hmac<Sha256>;

// ── X25519 ───────────────────────────────────────────────────────────────────

/// Low-order Curve25519 point encodings (the libsodium blocklist): the
/// identity, the order-4/order-8 generators, and p-1, p, p+1. A DH against
/// any of these yields a fully attacker-controlled shared secret.
const SMALL_ORDER_POINTS: [[u8; 32]; 7] = [
    // 0 (identity)
    [0; 32],
    // 1
    [
        0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0,
    ],
    // 325606250916557431795983626356110631294008115727848805560023387167927233504
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    // 39382357235489614581723060781553021112529911719440698176882885853963445705823
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    // p - 1
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p + 1
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
];

/// Validate a peer X25519 public key: reject the all-zero encoding and the
/// documented small-order points. X25519 ignores the top bit, so it is
/// masked before the table comparison.
pub fn validate_x25519_public(public: &[u8; X25519_KEY_LEN]) -> Result<(), ProtocolError> {
    let mut canonical = *public;
    canonical[31] &= 0x7f;
    for point in &SMALL_ORDER_POINTS {
        if bool::from(canonical.as_slice().ct_eq(point.as_slice())) {
            return Err(ProtocolError::HandshakeRejected(
                "peer X25519 public key is zero or small-order".into(),
            ));
        }
    }
    Ok(())
}

/// X25519 scalar multiplication with full peer-key validation.
///
/// Rejects invalid peer keys up front and an all-zero shared secret after
/// the fact (non-contributory exchange).
pub fn x25519(
    our_secret: &SecretBuffer,
    peer_public: &[u8; X25519_KEY_LEN],
) -> Result<SecretBuffer, ProtocolError> {
    validate_x25519_public(peer_public)?;
    let secret = x25519_dalek::StaticSecret::from(*our_secret.as_key32()?);
    let public = x25519_dalek::PublicKey::from(*peer_public);
    let shared = secret.diffie_hellman(&public);
    if bool::from(shared.as_bytes().as_slice().ct_eq(&[0u8; X25519_KEY_LEN])) {
        return Err(ProtocolError::HandshakeRejected(
            "X25519 produced an all-zero shared secret".into(),
        ));
    }
    SecretBuffer::from_slice(shared.as_bytes())
}

/// Public half for an X25519 secret.
pub fn x25519_public(secret: &SecretBuffer) -> Result<[u8; X25519_KEY_LEN], ProtocolError> {
    let secret = x25519_dalek::StaticSecret::from(*secret.as_key32()?);
    Ok(x25519_dalek::PublicKey::from(&secret).to_bytes())
}

/// Fresh X25519 keypair from the CSRNG, secret half in locked memory.
pub fn generate_x25519_keypair() -> Result<(SecretBuffer, [u8; X25519_KEY_LEN]), ProtocolError> {
    let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret).to_bytes();
    let buf = SecretBuffer::from_slice(&secret.to_bytes())?;
    Ok((buf, public))
}

// ── Ed25519 ──────────────────────────────────────────────────────────────────

pub fn ed25519_sign(
    secret: &SecretBuffer,
    message: &[u8],
) -> Result<[u8; ED25519_SIGNATURE_LEN], ProtocolError> {
    let signing = ed25519_dalek::SigningKey::from_bytes(secret.as_key32()?);
    Ok(signing.sign(message).to_bytes())
}

pub fn ed25519_public(secret: &SecretBuffer) -> Result<[u8; ED25519_PUBLIC_LEN], ProtocolError> {
    let signing = ed25519_dalek::SigningKey::from_bytes(secret.as_key32()?);
    Ok(signing.verifying_key().to_bytes())
}

/// Verify an Ed25519 signature over raw bytes.
///
/// `Ok(false)` is a well-formed key with a mismatching signature; a
/// malformed public key is an input error.
pub fn ed25519_verify(
    public: &[u8; ED25519_PUBLIC_LEN],
    message: &[u8],
    signature: &[u8; ED25519_SIGNATURE_LEN],
) -> Result<bool, ProtocolError> {
    let verifying = ed25519_dalek::VerifyingKey::from_bytes(public)
        .map_err(|_| ProtocolError::InvalidInput("malformed Ed25519 public key".into()))?;
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    Ok(verifying.verify(message, &sig).is_ok())
}

// ── HKDF-SHA256 ──────────────────────────────────────────────────────────────

/// HKDF-Extract. An absent salt means 32 zero bytes, per RFC 5869.
pub fn hkdf_extract(salt: Option<&[u8]>, ikm: &[u8]) -> Result<SecretBuffer, ProtocolError> {
    let (prk, _) = Hkdf::<Sha256>::extract(salt, ikm);
    SecretBuffer::from_slice(&prk)
}

/// HKDF-Expand from a 32-byte PRK into a fresh secret of `len` bytes.
pub fn hkdf_expand(
    prk: &SecretBuffer,
    info: &[u8],
    len: usize,
) -> Result<SecretBuffer, ProtocolError> {
    let mut out = SecretBuffer::zeroed(len)?;
    hkdf_expand_into(prk, info, out.write())?;
    Ok(out)
}

/// HKDF-Expand directly into a caller-provided buffer.
pub fn hkdf_expand_into(
    prk: &SecretBuffer,
    info: &[u8],
    out: &mut [u8],
) -> Result<(), ProtocolError> {
    let hk = Hkdf::<Sha256>::from_prk(prk.read())?;
    hk.expand(info, out)?;
    Ok(())
}

// ── HMAC-SHA256 ──────────────────────────────────────────────────────────────

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; SHA256_LEN], ProtocolError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ProtocolError::CryptoInternal(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time HMAC verification.
pub fn hmac_verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool, ProtocolError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ProtocolError::CryptoInternal(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

// ── AES-256-GCM ──────────────────────────────────────────────────────────────

/// Opaque AEAD failure. Callers decide whether a tag mismatch is a
/// metadata- or payload-auth error; the distinction does not exist here.
#[derive(Debug)]
pub struct AeadFailure;

/// Encrypt and authenticate. Output is ciphertext ∥ 16-byte tag.
pub fn aead_seal(
    key: &[u8; AES_KEY_LEN],
    nonce: &[u8; AES_NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| ProtocolError::CryptoInternal(format!("aes-gcm key: {e}")))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| ProtocolError::CryptoInternal("aes-gcm encryption failed".into()))
}

/// Decrypt and verify a ciphertext ∥ tag blob. Plaintext comes back in a
/// self-wiping buffer.
pub fn aead_open(
    key: &[u8; AES_KEY_LEN],
    nonce: &[u8; AES_NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, AeadFailure> {
    if ciphertext.len() < AES_TAG_LEN {
        return Err(AeadFailure);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AeadFailure)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| AeadFailure)
}

// ── CSRNG ────────────────────────────────────────────────────────────────────

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

pub fn random_u32() -> u32 {
    let mut out = [0u8; 4];
    OsRng.fill_bytes(&mut out);
    u32::from_le_bytes(out)
}

// ── SHA-256 ──────────────────────────────────────────────────────────────────

pub fn sha256(data: &[u8]) -> [u8; SHA256_LEN] {
    use sha2::Digest;
    Sha256::digest(data).into()
}

/// Concatenate-and-hash without an intermediate allocation surviving.
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; SHA256_LEN] {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_and_small_order_keys() {
        assert!(validate_x25519_public(&[0u8; 32]).is_err());
        for point in &SMALL_ORDER_POINTS {
            assert!(validate_x25519_public(point).is_err());
            // High bit must not mask the rejection.
            let mut high = *point;
            high[31] |= 0x80;
            assert!(validate_x25519_public(&high).is_err());
        }
        let (_, public) = generate_x25519_keypair().unwrap();
        assert!(validate_x25519_public(&public).is_ok());
    }

    #[test]
    fn x25519_agreement_is_symmetric() {
        let (a_secret, a_public) = generate_x25519_keypair().unwrap();
        let (b_secret, b_public) = generate_x25519_keypair().unwrap();
        let ab = x25519(&a_secret, &b_public).unwrap();
        let ba = x25519(&b_secret, &a_public).unwrap();
        assert!(ab.ct_eq(ba.read()));
    }

    #[test]
    fn ed25519_roundtrip_and_reject() {
        let secret = SecretBuffer::random(32).unwrap();
        let public = ed25519_public(&secret).unwrap();
        let sig = ed25519_sign(&secret, b"attested bytes").unwrap();
        assert!(ed25519_verify(&public, b"attested bytes", &sig).unwrap());
        assert!(!ed25519_verify(&public, b"attested byteZ", &sig).unwrap());
    }

    #[test]
    fn hkdf_rfc5869_test_case_1() {
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();
        let prk = hkdf_extract(Some(&salt), &ikm).unwrap();
        let mut okm = [0u8; 42];
        hkdf_expand_into(&prk, &info, &mut okm).unwrap();
        let expected = hex::decode(
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf\
             34007208d5b887185865",
        )
        .unwrap();
        assert_eq!(&okm[..], &expected[..]);
    }

    #[test]
    fn hmac_rfc4231_test_case_1() {
        let key = [0x0bu8; 20];
        let tag = hmac_sha256(&key, b"Hi There").unwrap();
        let expected =
            hex::decode("b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7")
                .unwrap();
        assert_eq!(&tag[..], &expected[..]);
        assert!(hmac_verify(&key, b"Hi There", &tag).unwrap());
        assert!(!hmac_verify(&key, b"Hi There!", &tag).unwrap());
    }

    #[test]
    fn aead_roundtrip_tag_split() {
        let key = [0x42u8; 32];
        let nonce = [0x24u8; 12];
        let sealed = aead_seal(&key, &nonce, b"aad", b"payload").unwrap();
        assert_eq!(sealed.len(), b"payload".len() + AES_TAG_LEN);
        let opened = aead_open(&key, &nonce, b"aad", &sealed).unwrap();
        assert_eq!(&opened[..], b"payload");
    }

    #[test]
    fn aead_rejects_tampering_and_wrong_aad() {
        let key = [0x42u8; 32];
        let nonce = [0x24u8; 12];
        let mut sealed = aead_seal(&key, &nonce, b"aad", b"payload").unwrap();
        assert!(aead_open(&key, &nonce, b"other", &sealed).is_err());
        sealed[0] ^= 0x01;
        assert!(aead_open(&key, &nonce, b"aad", &sealed).is_err());
        assert!(aead_open(&key, &nonce, b"aad", &[0u8; 4]).is_err());
    }
}
