//! Key-exchange wire records.
//!
//! `PublicBundle` layout (sizes in bytes):
//!   identity Ed25519 public (32) ∥ identity X25519 public (32) ∥
//!   signed-pre-key id (u32) ∥ signed-pre-key public (32) ∥
//!   signed-pre-key signature (64) ∥ ephemeral flag (u8) [∥ ephemeral (32)]
//!   ∥ one-time-pre-key count (u32) ∥ { id (u32) ∥ public (32) }*
//!
//! Every X25519 public key is validated on decode: zero and small-order
//! encodings never make it past the parser.

use ecliptix_crypto::identity::{OneTimePreKeyPublic, PublicBundle};
use ecliptix_crypto::primitives::validate_x25519_public;

use crate::wire::{Reader, WireError, Writer};

/// Handshake message state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Init,
    Ack,
}

impl ExchangeState {
    fn to_wire(self) -> u8 {
        match self {
            ExchangeState::Init => 0,
            ExchangeState::Ack => 1,
        }
    }

    fn from_wire(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(ExchangeState::Init),
            1 => Ok(ExchangeState::Ack),
            other => Err(WireError::InvalidField(format!(
                "unknown exchange state {other}"
            ))),
        }
    }
}

/// Exchange type for an initial Double Ratchet session.
pub const EXCHANGE_TYPE_INITIAL_SESSION: u16 = 1;

/// Handshake wire message: a framed bundle plus the sender's initial
/// ratchet DH public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubKeyExchange {
    pub state: ExchangeState,
    pub exchange_type: u16,
    pub bundle: PublicBundle,
    pub initial_dh_public: [u8; 32],
}

impl PubKeyExchange {
    pub fn encode(&self) -> Vec<u8> {
        let bundle = encode_bundle(&self.bundle);
        let mut w = Writer::with_capacity(bundle.len() + 64);
        w.put_u8(self.state.to_wire());
        w.put_u16(self.exchange_type);
        w.put_bytes(&bundle);
        w.put_fixed(&self.initial_dh_public);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let state = ExchangeState::from_wire(r.u8()?)?;
        let exchange_type = r.u16()?;
        let bundle = decode_bundle(r.bytes()?)?;
        let initial_dh_public = r.fixed::<32>()?;
        r.expect_end()?;
        validate_x25519_public(&initial_dh_public)
            .map_err(|e| WireError::InvalidField(e.to_string()))?;
        Ok(Self {
            state,
            exchange_type,
            bundle,
            initial_dh_public,
        })
    }
}

pub fn encode_bundle(bundle: &PublicBundle) -> Vec<u8> {
    let mut w = Writer::with_capacity(170 + bundle.one_time_prekeys.len() * 36);
    w.put_fixed(&bundle.identity_ed25519);
    w.put_fixed(&bundle.identity_x25519);
    w.put_u32(bundle.signed_prekey_id);
    w.put_fixed(&bundle.signed_prekey_public);
    w.put_fixed(&bundle.signed_prekey_signature);
    match &bundle.ephemeral_x25519 {
        Some(ephemeral) => {
            w.put_u8(1);
            w.put_fixed(ephemeral);
        }
        None => w.put_u8(0),
    }
    w.put_u32(bundle.one_time_prekeys.len() as u32);
    for otpk in &bundle.one_time_prekeys {
        w.put_u32(otpk.id);
        w.put_fixed(&otpk.public);
    }
    w.finish()
}

pub fn decode_bundle(buf: &[u8]) -> Result<PublicBundle, WireError> {
    let mut r = Reader::new(buf);
    let identity_ed25519 = r.fixed::<32>()?;
    let identity_x25519 = r.fixed::<32>()?;
    let signed_prekey_id = r.u32()?;
    let signed_prekey_public = r.fixed::<32>()?;
    let signed_prekey_signature = r.fixed::<64>()?;
    let ephemeral_x25519 = match r.u8()? {
        0 => None,
        1 => Some(r.fixed::<32>()?),
        other => {
            return Err(WireError::InvalidField(format!(
                "ephemeral flag must be 0 or 1, got {other}"
            )))
        }
    };
    let count = r.u32()?;
    // Each entry is 36 bytes; bound before allocating.
    if count as usize > r.remaining() / 36 {
        return Err(WireError::InvalidField(format!(
            "one-time-pre-key count {count} exceeds record size"
        )));
    }
    let mut one_time_prekeys = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.u32()?;
        let public = r.fixed::<32>()?;
        one_time_prekeys.push(OneTimePreKeyPublic { id, public });
    }
    r.expect_end()?;

    let bundle = PublicBundle {
        identity_ed25519,
        identity_x25519,
        signed_prekey_id,
        signed_prekey_public,
        signed_prekey_signature,
        ephemeral_x25519,
        one_time_prekeys,
    };
    bundle
        .validate()
        .map_err(|e| WireError::InvalidField(e.to_string()))?;
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecliptix_crypto::identity::IdentityKeys;

    fn sample_bundle(with_ephemeral: bool) -> PublicBundle {
        let mut keys = IdentityKeys::generate(3).unwrap();
        if with_ephemeral {
            keys.generate_ephemeral().unwrap();
        }
        keys.create_public_bundle()
    }

    #[test]
    fn bundle_roundtrip_is_identity() {
        for with_ephemeral in [false, true] {
            let bundle = sample_bundle(with_ephemeral);
            let decoded = decode_bundle(&encode_bundle(&bundle)).unwrap();
            assert_eq!(decoded, bundle);
        }
    }

    #[test]
    fn exchange_roundtrip_is_identity() {
        let bundle = sample_bundle(true);
        let exchange = PubKeyExchange {
            state: ExchangeState::Init,
            exchange_type: EXCHANGE_TYPE_INITIAL_SESSION,
            bundle,
            initial_dh_public: sample_bundle(false).identity_x25519,
        };
        let decoded = PubKeyExchange::decode(&exchange.encode()).unwrap();
        assert_eq!(decoded, exchange);
    }

    #[test]
    fn decode_rejects_zero_keys() {
        let mut bundle = sample_bundle(false);
        bundle.identity_x25519 = [0u8; 32];
        assert!(decode_bundle(&encode_bundle(&bundle)).is_err());
    }

    #[test]
    fn decode_rejects_truncation_and_trailing() {
        let encoded = encode_bundle(&sample_bundle(true));
        assert!(decode_bundle(&encoded[..encoded.len() - 1]).is_err());
        let mut padded = encoded;
        padded.push(0);
        assert!(decode_bundle(&padded).is_err());
    }

    #[test]
    fn decode_rejects_hostile_prekey_count() {
        // A bundle with an empty pre-key list ends with the count field.
        let mut bundle = sample_bundle(false);
        bundle.one_time_prekeys.clear();
        let mut encoded = encode_bundle(&bundle);
        let len = encoded.len();
        encoded[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(decode_bundle(&encoded).is_err());
    }
}
