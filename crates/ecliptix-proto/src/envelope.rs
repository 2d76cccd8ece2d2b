//! Authenticated message envelope — what the transport sees.
//!
//! The transport is a dumb relay: it carries encrypted metadata, an
//! encrypted payload (ciphertext ∥ 16-byte tag, one blob), the metadata
//! nonce, a timestamp, a result code, and — only on the first message of a
//! ratchet epoch — the sender's DH public key. The plaintext metadata
//! (request id, message nonce, ratchet index) is itself AES-GCM-encrypted
//! under a session-derived key, so indices and nonces never travel in the
//! clear.

use chrono::{DateTime, TimeZone, Utc};
use ecliptix_crypto::primitives::AES_NONCE_LEN;

use crate::wire::{Reader, WireError, Writer};

/// Result code carried on every envelope.
pub const RESULT_SUCCESS: i32 = 0;

/// On-wire envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureEnvelope {
    /// AES-GCM-encrypted [`EnvelopeMetadata`] (ciphertext ∥ tag).
    pub metadata: Vec<u8>,
    /// AES-GCM-encrypted payload (ciphertext ∥ tag).
    pub payload: Vec<u8>,
    /// Nonce for the metadata encryption (random per envelope).
    pub header_nonce: [u8; AES_NONCE_LEN],
    pub timestamp: DateTime<Utc>,
    pub result_code: i32,
    /// Sender DH public, present on the first message after a DH ratchet.
    pub dh_public: Option<[u8; 32]>,
}

impl SecureEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut w =
            Writer::with_capacity(self.metadata.len() + self.payload.len() + 72);
        w.put_bytes(&self.metadata);
        w.put_bytes(&self.payload);
        w.put_fixed(&self.header_nonce);
        w.put_i64(self.timestamp.timestamp());
        w.put_u32(self.timestamp.timestamp_subsec_nanos());
        w.put_i32(self.result_code);
        match &self.dh_public {
            Some(dh) => {
                w.put_u8(1);
                w.put_fixed(dh);
            }
            None => w.put_u8(0),
        }
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let metadata = r.bytes()?.to_vec();
        let payload = r.bytes()?.to_vec();
        let header_nonce = r.fixed::<AES_NONCE_LEN>()?;
        let secs = r.i64()?;
        let nanos = r.u32()?;
        let timestamp = Utc
            .timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| WireError::InvalidField(format!("timestamp {secs}.{nanos}")))?;
        let result_code = r.i32()?;
        let dh_public = match r.u8()? {
            0 => None,
            1 => Some(r.fixed::<32>()?),
            other => {
                return Err(WireError::InvalidField(format!(
                    "DH flag must be 0 or 1, got {other}"
                )))
            }
        };
        r.expect_end()?;
        Ok(Self {
            metadata,
            payload,
            header_nonce,
            timestamp,
            result_code,
            dh_public,
        })
    }
}

/// Plaintext metadata, encrypted inside the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeMetadata {
    pub request_id: u32,
    /// Deterministic message nonce (epoch prefix ∥ big-endian counter).
    pub nonce: [u8; AES_NONCE_LEN],
    pub ratchet_index: u32,
}

impl EnvelopeMetadata {
    pub const ENCODED_LEN: usize = 4 + AES_NONCE_LEN + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::ENCODED_LEN);
        w.put_u32(self.request_id);
        w.put_fixed(&self.nonce);
        w.put_u32(self.ratchet_index);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let request_id = r.u32()?;
        let nonce = r.fixed::<AES_NONCE_LEN>()?;
        let ratchet_index = r.u32()?;
        r.expect_end()?;
        Ok(Self {
            request_id,
            nonce,
            ratchet_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SecureEnvelope {
        SecureEnvelope {
            metadata: vec![1, 2, 3, 4],
            payload: vec![5; 40],
            header_nonce: [7u8; 12],
            timestamp: Utc.timestamp_opt(1_700_000_123, 456_000_000).unwrap(),
            result_code: RESULT_SUCCESS,
            dh_public: Some([9u8; 32]),
        }
    }

    #[test]
    fn envelope_roundtrip_with_and_without_dh() {
        let with_dh = sample();
        assert_eq!(SecureEnvelope::decode(&with_dh.encode()).unwrap(), with_dh);
        let mut without = sample();
        without.dh_public = None;
        assert_eq!(SecureEnvelope::decode(&without.encode()).unwrap(), without);
    }

    #[test]
    fn metadata_roundtrip() {
        let meta = EnvelopeMetadata {
            request_id: 0xfeed_f00d,
            nonce: [3u8; 12],
            ratchet_index: 41,
        };
        let encoded = meta.encode();
        assert_eq!(encoded.len(), EnvelopeMetadata::ENCODED_LEN);
        assert_eq!(EnvelopeMetadata::decode(&encoded).unwrap(), meta);
    }

    #[test]
    fn envelope_decode_rejects_bad_flag() {
        let mut encoded = sample().encode();
        let flag_pos = encoded.len() - 33;
        encoded[flag_pos] = 2;
        assert!(SecureEnvelope::decode(&encoded).is_err());
    }

    #[test]
    fn metadata_decode_rejects_wrong_length() {
        assert!(EnvelopeMetadata::decode(&[0u8; 19]).is_err());
        assert!(EnvelopeMetadata::decode(&[0u8; 21]).is_err());
    }
}
