//! Envelope production and consumption.
//!
//! Associated data is role-oriented — `initiator identity X25519 ∥
//! responder identity X25519` — so both sides authenticate every record
//! against the same pair of identities regardless of who encrypts.
//!
//! Consumption order is fixed: receiving DH ratchet (when a new peer key is
//! advertised) → metadata decryption → replay check → message-key
//! derivation → payload decryption → consume marking. Key derivation is
//! staged and committed only after the payload authenticates, so a
//! tampered envelope never advances the receiving chain.
//!
//! Late deliveries from the previous receiving epoch are served from the
//! session's retired key store: routed there directly when the envelope
//! advertises the retired peer DH key, or as a fallback when the current
//! chain rejects the payload.

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use ecliptix_crypto::chain::KeyAccess;
use ecliptix_crypto::identity::IdentityKeys;
use ecliptix_crypto::primitives::{self, X25519_KEY_LEN};
use ecliptix_crypto::ratchet::{RatchetSession, Role};
use ecliptix_crypto::ProtocolError;

use crate::envelope::{EnvelopeMetadata, SecureEnvelope, RESULT_SUCCESS};

/// Role-oriented associated data: initiator identity X25519 ∥ responder
/// identity X25519.
pub fn associated_data(
    identity: &IdentityKeys,
    session: &RatchetSession,
) -> Result<[u8; 2 * X25519_KEY_LEN], ProtocolError> {
    let peer = session
        .peer_bundle()
        .ok_or_else(|| ProtocolError::InvalidInput("peer bundle not set".into()))?;
    let mut ad = [0u8; 2 * X25519_KEY_LEN];
    let (initiator, responder) = match session.role() {
        Role::Initiator => (identity.identity_x25519_public(), &peer.identity_x25519),
        Role::Responder => (&peer.identity_x25519, identity.identity_x25519_public()),
    };
    ad[..X25519_KEY_LEN].copy_from_slice(initiator);
    ad[X25519_KEY_LEN..].copy_from_slice(responder);
    Ok(ad)
}

/// Advance the sending chain, encrypt `plaintext`, and assemble the
/// envelope. Returns the envelope and whether a sending DH ratchet ran.
pub fn produce_envelope(
    identity: &IdentityKeys,
    session: &mut RatchetSession,
    plaintext: &[u8],
    now: DateTime<Utc>,
) -> Result<(SecureEnvelope, bool), ProtocolError> {
    let step = session.prepare_next_send_message(now)?;
    let nonce = session.generate_next_nonce()?;
    let ad = associated_data(identity, session)?;

    let payload = session.with_send_key(step.index, |key| {
        primitives::aead_seal(key, &nonce, &ad, plaintext)
    })??;

    let metadata = EnvelopeMetadata {
        request_id: primitives::random_u32(),
        nonce,
        ratchet_index: step.index,
    };
    let header_nonce: [u8; 12] = primitives::random_array();
    let serialized = Zeroizing::new(metadata.encode());
    let encrypted_metadata = {
        let key = session.metadata_key()?;
        primitives::aead_seal(key.as_key32()?, &header_nonce, &ad, &serialized)?
    };

    let dh_public = if step.include_dh {
        Some(session.sender_dh_public()?)
    } else {
        None
    };

    Ok((
        SecureEnvelope {
            metadata: encrypted_metadata,
            payload,
            header_nonce,
            timestamp: now,
            result_code: RESULT_SUCCESS,
            dh_public,
        },
        step.ratcheted,
    ))
}

/// Decrypt and authenticate an incoming envelope. Returns the plaintext
/// and whether a receiving DH ratchet ran.
pub fn consume_envelope(
    identity: &IdentityKeys,
    session: &mut RatchetSession,
    envelope: &SecureEnvelope,
    now: DateTime<Utc>,
) -> Result<(Zeroizing<Vec<u8>>, bool), ProtocolError> {
    let mut ratcheted = false;
    if let Some(dh) = &envelope.dh_public {
        if !session.is_current_peer_dh(dh) && !session.is_retired_peer_dh(dh) {
            session.perform_receiving_ratchet(*dh, now)?;
            ratcheted = true;
        }
    }

    let ad = associated_data(identity, session)?;
    let metadata = open_metadata(session, envelope, &ad)?;

    // Envelopes advertising the retired peer DH key belong to the previous
    // receiving epoch; everything else targets the current chain first.
    let retired_only = envelope
        .dh_public
        .as_ref()
        .is_some_and(|dh| session.is_retired_peer_dh(dh));
    if retired_only {
        let plaintext = open_retired(session, &metadata, &ad, &envelope.payload)?;
        return Ok((plaintext, ratcheted));
    }

    match open_current(session, &metadata, &ad, &envelope.payload) {
        Ok(plaintext) => Ok((plaintext, ratcheted)),
        // A late skipped message from the retired epoch carries no DH key
        // and collides with the current chain's index space; the retained
        // key decides, and a consumed one makes the duplicate explicit.
        Err(ProtocolError::PayloadAuthFailed) if envelope.dh_public.is_none() => {
            if session.has_retired_key(metadata.ratchet_index) {
                let plaintext = open_retired(session, &metadata, &ad, &envelope.payload)?;
                Ok((plaintext, ratcheted))
            } else if session.was_retired_key_consumed(metadata.ratchet_index) {
                Err(ProtocolError::Replay)
            } else {
                Err(ProtocolError::PayloadAuthFailed)
            }
        }
        Err(e) => Err(e),
    }
}

fn open_metadata(
    session: &RatchetSession,
    envelope: &SecureEnvelope,
    ad: &[u8],
) -> Result<EnvelopeMetadata, ProtocolError> {
    for key in session.metadata_key_history() {
        if let Ok(serialized) = primitives::aead_open(
            key.as_key32()?,
            &envelope.header_nonce,
            ad,
            &envelope.metadata,
        ) {
            return Ok(EnvelopeMetadata::decode(&serialized)?);
        }
    }
    Err(ProtocolError::MetadataAuthFailed)
}

fn open_current(
    session: &mut RatchetSession,
    metadata: &EnvelopeMetadata,
    ad: &[u8],
    payload: &[u8],
) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    session.check_replay_protection(&metadata.nonce, metadata.ratchet_index)?;
    let plaintext = match session.process_received_message(metadata.ratchet_index)? {
        KeyAccess::Cached => session
            .with_recv_key(metadata.ratchet_index, |key| {
                primitives::aead_open(key, &metadata.nonce, ad, payload)
            })?
            .map_err(|_| ProtocolError::PayloadAuthFailed)?,
        KeyAccess::Staged(staged) => {
            let plaintext = staged
                .with_target_key(|key| primitives::aead_open(key, &metadata.nonce, ad, payload))?
                .map_err(|_| ProtocolError::PayloadAuthFailed)?;
            session.commit_received_message(staged);
            plaintext
        }
    };
    session.mark_consumed(&metadata.nonce, metadata.ratchet_index);
    Ok(plaintext)
}

fn open_retired(
    session: &mut RatchetSession,
    metadata: &EnvelopeMetadata,
    ad: &[u8],
    payload: &[u8],
) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    let plaintext = match session.stage_retired(metadata.ratchet_index)? {
        KeyAccess::Cached => session
            .with_retired_key(metadata.ratchet_index, |key| {
                primitives::aead_open(key, &metadata.nonce, ad, payload)
            })?
            .map_err(|_| ProtocolError::PayloadAuthFailed)?,
        KeyAccess::Staged(staged) => {
            let plaintext = staged
                .with_target_key(|key| primitives::aead_open(key, &metadata.nonce, ad, payload))?
                .map_err(|_| ProtocolError::PayloadAuthFailed)?;
            session.commit_retired(staged);
            plaintext
        }
    };
    session.consume_retired_key(metadata.ratchet_index);
    Ok(plaintext)
}
