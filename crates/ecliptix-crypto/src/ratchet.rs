//! Double Ratchet session state machine.
//!
//! State separation (non-negotiable):
//!   RK  — root key, replaced only by DH ratchet steps
//!   CKs — sending chain, advanced per outgoing message
//!   CKr — receiving chain, advanced per incoming message
//!   MK  — message keys, cached by index, consumed at most once
//!
//! Every DH ratchet performs HKDF-Extract(salt = RK, ikm = DH) followed by
//! HKDF-Expand(info = "ratchet", 96) and splits the output into
//! `root ∥ chainA ∥ chainB`. `chainB` always keys the chain owned by the
//! party that advertised the new DH key; handshake finalization — the one
//! step that seeds both chains from a single DH — gives the Initiator
//! send = chainB / recv = chainA and the Responder the mirror image.
//!
//! Sender DH keys are regenerated LAZILY: a receiving ratchet updates root
//! and receiving chain only, and the next send-side ratchet (driven by the
//! adaptive policy) generates the fresh pair. The key a peer ratchets
//! against is therefore always the key it last saw advertised, which keeps
//! the two sides in lockstep even across consecutive unilateral sender
//! ratchets.
//!
//! Atomicity: every ratchet stages its derivations in fresh SecretBuffers
//! and swaps them in only after all of them succeeded; the replaced buffers
//! wipe themselves on drop.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::chain::{ChainStep, KeyAccess, StagedAdvance, StepKind, DEFAULT_CACHE_WINDOW};
use crate::error::ProtocolError;
use crate::identity::PublicBundle;
use crate::policy::RatchetConfig;
use crate::primitives::{
    self, AES_NONCE_LEN, INFO_METADATA, INFO_NONCE_PREFIX, INFO_RATCHET, X25519_KEY_LEN,
};
use crate::replay::{ReplayWindow, DEFAULT_REPLAY_WINDOW};
use crate::secret::{constant_time_eq, SecretBuffer};

/// Ceiling on skipped-key derivation for one incoming message.
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// How many retired metadata keys stay usable for late deliveries.
const METADATA_KEY_HISTORY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, sender DH pair generated, awaiting handshake finalization.
    Fresh,
    Established,
    Terminated,
}

/// What `prepare_next_send` decided for one outgoing message.
#[derive(Debug, Clone, Copy)]
pub struct SendStep {
    /// Index of the derived message key in the sending chain.
    pub index: u32,
    /// The envelope must carry the current sender DH public.
    pub include_dh: bool,
    /// A sending DH ratchet ran as part of this step.
    pub ratcheted: bool,
}

/// The most recently retired receiving epoch. The whole chain is kept —
/// the wire metadata carries no previous-chain length, so skipped keys
/// from the old epoch may still need deriving after the roll-over.
/// `consumed` carries over the indices the replay window had seen.
struct RetiredEpoch {
    peer_dh_public: [u8; X25519_KEY_LEN],
    chain: ChainStep,
    consumed: BTreeSet<u32>,
}

/// Double Ratchet session for one connection.
pub struct RatchetSession {
    connect_id: u32,
    role: Role,
    state: SessionState,
    config: RatchetConfig,
    max_skip: u32,

    root_key: Option<SecretBuffer>,
    sending: Option<ChainStep>,
    receiving: Option<ChainStep>,
    /// Sender DH pair generated at creation, consumed by finalization.
    pending_dh: Option<(SecretBuffer, [u8; X25519_KEY_LEN])>,

    peer_dh_public: Option<[u8; X25519_KEY_LEN]>,
    peer_bundle: Option<PublicBundle>,
    retired: Option<RetiredEpoch>,

    replay: ReplayWindow,
    nonce_counter: u64,
    nonce_prefix: [u8; 4],
    /// Front entry is the current epoch's metadata key; the tail keeps a
    /// short history for late cross-epoch deliveries.
    metadata_keys: VecDeque<SecretBuffer>,

    /// A new peer DH key was consumed and the sending side has not rotated
    /// since (lazy variant bookkeeping).
    send_rekey_pending: bool,
    /// The next envelope must advertise our sender DH public.
    advertise_dh: bool,
    last_ratchet_at: DateTime<Utc>,
}

impl RatchetSession {
    /// Create a `Fresh` session with a newly generated sender DH pair.
    pub fn create(
        connect_id: u32,
        is_initiator: bool,
        config: RatchetConfig,
    ) -> Result<Self, ProtocolError> {
        let pending_dh = primitives::generate_x25519_keypair()?;
        Ok(Self {
            connect_id,
            role: if is_initiator { Role::Initiator } else { Role::Responder },
            state: SessionState::Fresh,
            config,
            max_skip: DEFAULT_MAX_SKIP,
            root_key: None,
            sending: None,
            receiving: None,
            pending_dh: Some(pending_dh),
            peer_dh_public: None,
            peer_bundle: None,
            retired: None,
            replay: ReplayWindow::new(DEFAULT_REPLAY_WINDOW),
            nonce_counter: 0,
            nonce_prefix: [0u8; 4],
            metadata_keys: VecDeque::new(),
            send_rekey_pending: false,
            advertise_dh: false,
            last_ratchet_at: Utc::now(),
        })
    }

    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_config(&mut self, config: RatchetConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    pub fn set_peer_bundle(&mut self, bundle: PublicBundle) {
        self.peer_bundle = Some(bundle);
    }

    pub fn peer_bundle(&self) -> Option<&PublicBundle> {
        self.peer_bundle.as_ref()
    }

    /// Our current sender DH public: the pending pair before finalization,
    /// the sending chain's slot afterwards.
    pub fn sender_dh_public(&self) -> Result<[u8; X25519_KEY_LEN], ProtocolError> {
        if let Some((_, public)) = &self.pending_dh {
            return Ok(*public);
        }
        self.sending
            .as_ref()
            .and_then(|c| c.dh_public().copied())
            .ok_or(ProtocolError::Terminated)
    }

    pub fn peer_dh_public(&self) -> Option<&[u8; X25519_KEY_LEN]> {
        self.peer_dh_public.as_ref()
    }

    fn ensure_established(&self) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Established => Ok(()),
            SessionState::Terminated => Err(ProtocolError::Terminated),
            SessionState::Fresh => Err(ProtocolError::InvalidInput(
                "handshake has not been finalized".into(),
            )),
        }
    }

    // ── Handshake finalization ───────────────────────────────────────────

    /// Transition Fresh → Established: run the first DH ratchet between our
    /// pending sender pair and the peer's initial DH public, seeding the
    /// root key and both chains. Initiator and Responder arrive at the same
    /// 96 derived bytes and take mirrored chain halves.
    pub fn finalize_chain_and_dh_keys(
        &mut self,
        root_key: SecretBuffer,
        peer_initial_dh: [u8; X25519_KEY_LEN],
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Fresh => {}
            SessionState::Terminated => return Err(ProtocolError::Terminated),
            SessionState::Established => {
                return Err(ProtocolError::InvalidInput(
                    "session is already established".into(),
                ))
            }
        }
        if root_key.len() != 32 {
            return Err(ProtocolError::InvalidInput(
                "root key must be 32 bytes".into(),
            ));
        }
        let (dh_secret, dh_public) = self
            .pending_dh
            .as_ref()
            .ok_or_else(|| ProtocolError::InvalidInput("sender DH pair missing".into()))?;
        if constant_time_eq(&peer_initial_dh, dh_public) {
            return Err(ProtocolError::HandshakeRejected(
                "peer echoed our initial DH public key".into(),
            ));
        }
        let dh = primitives::x25519(dh_secret, &peer_initial_dh)?;
        let (new_root, chain_a, chain_b) = ratchet_kdf(&root_key, &dh)?;
        drop(dh);
        drop(root_key);

        let (send_ck, recv_ck) = match self.role {
            Role::Initiator => (chain_b, chain_a),
            Role::Responder => (chain_a, chain_b),
        };
        let pair = self
            .pending_dh
            .take()
            .ok_or_else(|| ProtocolError::InvalidInput("sender DH pair missing".into()))?;
        self.sending = Some(ChainStep::create(
            StepKind::Sender,
            send_ck,
            Some(pair),
            DEFAULT_CACHE_WINDOW,
        )?);
        self.receiving = Some(ChainStep::create(
            StepKind::Receiver,
            recv_ck,
            None,
            DEFAULT_CACHE_WINDOW,
        )?);
        self.peer_dh_public = Some(peer_initial_dh);
        self.install_epoch_keys(&new_root)?;
        self.root_key = Some(new_root);
        self.nonce_counter = 0;
        self.state = SessionState::Established;
        self.advertise_dh = true;
        self.last_ratchet_at = now;
        tracing::debug!(connect_id = self.connect_id, role = ?self.role, "session established");
        Ok(())
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Advance the sending chain by one message, running a send-side DH
    /// ratchet first when the policy (or nonce-counter exhaustion) demands
    /// one.
    pub fn prepare_next_send_message(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<SendStep, ProtocolError> {
        self.ensure_established()?;
        let index = self.sending.as_ref().map(|c| c.current_index()).unwrap_or(0);
        let forced = self.nonce_counter == u64::MAX;
        let ratcheted = if forced
            || self.config.should_ratchet(
                index,
                self.last_ratchet_at,
                self.send_rekey_pending,
                now,
            ) {
            self.perform_sending_ratchet(now)?;
            true
        } else {
            false
        };
        let chain = self
            .sending
            .as_mut()
            .ok_or(ProtocolError::Terminated)?;
        let index = chain.advance()?;
        let include_dh = self.advertise_dh;
        self.advertise_dh = false;
        Ok(SendStep {
            index,
            include_dh,
            ratcheted,
        })
    }

    /// Lend the message key at `index` in the sending chain.
    pub fn with_send_key<R>(
        &self,
        index: u32,
        f: impl FnOnce(&[u8; 32]) -> R,
    ) -> Result<R, ProtocolError> {
        self.ensure_established()?;
        self.sending
            .as_ref()
            .ok_or(ProtocolError::Terminated)?
            .with_key(index, f)
    }

    /// Deterministic nonce for the current sending epoch:
    /// 4-byte epoch prefix ∥ 8-byte big-endian counter.
    pub fn generate_next_nonce(&mut self) -> Result<[u8; AES_NONCE_LEN], ProtocolError> {
        self.ensure_established()?;
        let mut nonce = [0u8; AES_NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_prefix);
        nonce[4..].copy_from_slice(&self.nonce_counter.to_be_bytes());
        // Exhaustion forces a ratchet on the next send; see
        // prepare_next_send_message.
        self.nonce_counter = self.nonce_counter.saturating_add(1);
        Ok(nonce)
    }

    fn perform_sending_ratchet(&mut self, now: DateTime<Utc>) -> Result<(), ProtocolError> {
        let peer = self
            .peer_dh_public
            .ok_or_else(|| ProtocolError::InvalidInput("peer DH public unknown".into()))?;
        let root = self
            .root_key
            .as_ref()
            .ok_or(ProtocolError::Terminated)?;
        let (new_secret, new_public) = primitives::generate_x25519_keypair()?;
        let dh = primitives::x25519(&new_secret, &peer)?;
        let (new_root, _chain_a, chain_b) = ratchet_kdf(root, &dh)?;
        drop(dh);

        self.sending
            .as_mut()
            .ok_or(ProtocolError::Terminated)?
            .update_after_dh_ratchet(chain_b, Some((new_secret, new_public)))?;
        self.install_epoch_keys(&new_root)?;
        self.root_key = Some(new_root);
        self.nonce_counter = 0;
        self.send_rekey_pending = false;
        self.advertise_dh = true;
        self.last_ratchet_at = now;
        tracing::debug!(connect_id = self.connect_id, "sending DH ratchet performed");
        Ok(())
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// True when `candidate` matches the stored peer DH public.
    pub fn is_current_peer_dh(&self, candidate: &[u8; X25519_KEY_LEN]) -> bool {
        self.peer_dh_public
            .as_ref()
            .is_some_and(|current| constant_time_eq(current, candidate))
    }

    /// True when `candidate` matches the retired epoch's peer DH public.
    pub fn is_retired_peer_dh(&self, candidate: &[u8; X25519_KEY_LEN]) -> bool {
        self.retired
            .as_ref()
            .is_some_and(|r| constant_time_eq(&r.peer_dh_public, candidate))
    }

    /// DH ratchet the receiving side against a newly advertised peer key.
    /// Idempotent on the stored key; the caller must have routed retired
    /// keys elsewhere.
    pub fn perform_receiving_ratchet(
        &mut self,
        peer_dh: [u8; X25519_KEY_LEN],
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolError> {
        self.ensure_established()?;
        if self.is_current_peer_dh(&peer_dh) {
            return Ok(());
        }
        primitives::validate_x25519_public(&peer_dh)?;
        let our_public = self.sender_dh_public()?;
        if constant_time_eq(&peer_dh, &our_public) {
            return Err(ProtocolError::HandshakeRejected(
                "peer advertised our own DH public key".into(),
            ));
        }
        let sending = self.sending.as_ref().ok_or(ProtocolError::Terminated)?;
        let our_secret = sending
            .dh_secret()
            .ok_or_else(|| ProtocolError::InvalidInput("sender DH slot empty".into()))?;
        let root = self.root_key.as_ref().ok_or(ProtocolError::Terminated)?;

        let dh = primitives::x25519(our_secret, &peer_dh)?;
        let (new_root, _chain_a, chain_b) = ratchet_kdf(root, &dh)?;
        drop(dh);

        // Retire the old epoch: the chain survives until the next ratchet,
        // so late out-of-order deliveries still decrypt. Indices the replay
        // window saw carry over as consumed.
        let new_chain = ChainStep::create(StepKind::Receiver, chain_b, None, DEFAULT_CACHE_WINDOW)?;
        let receiving = self.receiving.as_mut().ok_or(ProtocolError::Terminated)?;
        let old_chain = std::mem::replace(receiving, new_chain);
        if let Some(old_peer) = self.peer_dh_public {
            let consumed = self.replay.observations().map(|(_, i)| i).collect();
            self.retired = Some(RetiredEpoch {
                peer_dh_public: old_peer,
                chain: old_chain,
                consumed,
            });
        }
        self.replay.clear();
        self.peer_dh_public = Some(peer_dh);
        self.install_epoch_keys(&new_root)?;
        self.root_key = Some(new_root);
        self.send_rekey_pending = true;
        self.last_ratchet_at = now;
        tracing::debug!(connect_id = self.connect_id, "receiving DH ratchet performed");
        Ok(())
    }

    /// Stage the receiving-chain key for `ratchet_index`, deriving and
    /// caching any skipped keys on the way. Nothing is committed until
    /// [`RatchetSession::commit_received_message`].
    pub fn process_received_message(
        &self,
        ratchet_index: u32,
    ) -> Result<KeyAccess, ProtocolError> {
        self.ensure_established()?;
        self.receiving
            .as_ref()
            .ok_or(ProtocolError::Terminated)?
            .stage(ratchet_index, self.max_skip)
    }

    pub fn commit_received_message(&mut self, staged: StagedAdvance) {
        if let Some(receiving) = self.receiving.as_mut() {
            receiving.commit(staged);
        }
    }

    /// Lend a cached receiving-chain message key.
    pub fn with_recv_key<R>(
        &self,
        index: u32,
        f: impl FnOnce(&[u8; 32]) -> R,
    ) -> Result<R, ProtocolError> {
        self.ensure_established()?;
        self.receiving
            .as_ref()
            .ok_or(ProtocolError::Terminated)?
            .with_key(index, f)
    }

    pub fn receiving_index(&self) -> u32 {
        self.receiving.as_ref().map(|c| c.current_index()).unwrap_or(0)
    }

    pub fn sending_index(&self) -> u32 {
        self.sending.as_ref().map(|c| c.current_index()).unwrap_or(0)
    }

    // ── Replay protection ────────────────────────────────────────────────

    pub fn check_replay_protection(
        &self,
        nonce: &[u8; AES_NONCE_LEN],
        ratchet_index: u32,
    ) -> Result<(), ProtocolError> {
        self.ensure_established()?;
        self.replay.check(nonce, ratchet_index, self.receiving_index())
    }

    pub fn mark_consumed(&mut self, nonce: &[u8; AES_NONCE_LEN], ratchet_index: u32) {
        let current = self.receiving_index();
        self.replay.mark(nonce, ratchet_index, current);
    }

    // ── Retired epoch access ─────────────────────────────────────────────

    /// Stage a key lookup on the retired receiving chain. Already-consumed
    /// indices and indices the retired chain can no longer reach fail with
    /// `Replay`.
    pub fn stage_retired(&self, index: u32) -> Result<KeyAccess, ProtocolError> {
        let retired = self.retired.as_ref().ok_or(ProtocolError::Replay)?;
        if retired.consumed.contains(&index) {
            return Err(ProtocolError::Replay);
        }
        retired.chain.stage(index, self.max_skip).map_err(|e| match e {
            ProtocolError::IndexInPast(_) => ProtocolError::Replay,
            other => other,
        })
    }

    pub fn commit_retired(&mut self, staged: StagedAdvance) {
        if let Some(retired) = self.retired.as_mut() {
            retired.chain.commit(staged);
        }
    }

    /// Lend a cached key from the retired receiving chain.
    pub fn with_retired_key<R>(
        &self,
        index: u32,
        f: impl FnOnce(&[u8; 32]) -> R,
    ) -> Result<R, ProtocolError> {
        let retired = self.retired.as_ref().ok_or(ProtocolError::Replay)?;
        retired.chain.with_key(index, f)
    }

    /// True when the retired epoch could still serve `index`.
    pub fn has_retired_key(&self, index: u32) -> bool {
        self.retired.as_ref().is_some_and(|r| {
            !r.consumed.contains(&index)
                && (r.chain.is_cached(index) || index > r.chain.current_index())
        })
    }

    /// Mark a retired key consumed; a second arrival at the same index
    /// then fails with `Replay`.
    pub fn consume_retired_key(&mut self, index: u32) {
        if let Some(retired) = self.retired.as_mut() {
            retired.consumed.insert(index);
        }
    }

    /// True when `index` belonged to the retired epoch and was consumed.
    pub fn was_retired_key_consumed(&self, index: u32) -> bool {
        self.retired
            .as_ref()
            .is_some_and(|r| r.consumed.contains(&index))
    }

    // ── Metadata encryption keys ─────────────────────────────────────────

    /// Current epoch's metadata-encryption key, derived once per ratchet
    /// from the root key (info = "metadata").
    pub fn metadata_key(&self) -> Result<&SecretBuffer, ProtocolError> {
        self.ensure_established()?;
        self.metadata_keys.front().ok_or(ProtocolError::Terminated)
    }

    /// Current plus retained previous-epoch metadata keys, newest first.
    pub fn metadata_key_history(&self) -> impl Iterator<Item = &SecretBuffer> {
        self.metadata_keys.iter()
    }

    fn install_epoch_keys(&mut self, root: &SecretBuffer) -> Result<(), ProtocolError> {
        let metadata = primitives::hkdf_expand(root, INFO_METADATA, 32)?;
        let mut prefix = [0u8; 4];
        primitives::hkdf_expand_into(root, INFO_NONCE_PREFIX, &mut prefix)?;
        self.nonce_prefix = prefix;
        self.metadata_keys.push_front(metadata);
        self.metadata_keys.truncate(METADATA_KEY_HISTORY);
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Wipe all key material and refuse further operations.
    pub fn terminate(&mut self) {
        self.root_key = None;
        self.sending = None;
        self.receiving = None;
        self.pending_dh = None;
        self.retired = None;
        self.metadata_keys.clear();
        self.replay.clear();
        self.nonce_counter = 0;
        self.nonce_prefix.zeroize();
        self.state = SessionState::Terminated;
        tracing::debug!(connect_id = self.connect_id, "session terminated");
    }

    // ── Snapshot ─────────────────────────────────────────────────────────

    /// Abstract snapshot of the established session. The embedder is
    /// responsible for encrypting it at rest.
    pub fn snapshot(&self) -> Result<SessionSnapshot, ProtocolError> {
        self.ensure_established()?;
        let root = self.root_key.as_ref().ok_or(ProtocolError::Terminated)?;
        let sending = self.sending.as_ref().ok_or(ProtocolError::Terminated)?;
        let receiving = self.receiving.as_ref().ok_or(ProtocolError::Terminated)?;
        Ok(SessionSnapshot {
            connect_id: self.connect_id,
            role: self.role,
            root_key: root.read().to_vec(),
            sending: chain_snapshot(sending),
            receiving: chain_snapshot(receiving),
            peer_dh_public: self
                .peer_dh_public
                .ok_or_else(|| ProtocolError::InvalidInput("peer DH public unknown".into()))?,
            peer_bundle: self.peer_bundle.clone(),
            nonce_counter: self.nonce_counter,
            nonce_prefix: self.nonce_prefix,
            replay_window: self.replay.window(),
            replay_seen: self.replay.observations().map(|(n, i)| (*n, i)).collect(),
            send_rekey_pending: self.send_rekey_pending,
            advertise_dh: self.advertise_dh,
            last_ratchet_at: self.last_ratchet_at,
        })
    }

    /// Rebuild an established session from a snapshot. Retired-epoch keys
    /// and metadata-key history are not part of the snapshot; the current
    /// metadata key is re-derived from the root.
    pub fn restore(
        snapshot: &SessionSnapshot,
        config: RatchetConfig,
    ) -> Result<Self, ProtocolError> {
        let root = SecretBuffer::from_slice(&snapshot.root_key)?;
        let sending = restore_chain(&snapshot.sending, StepKind::Sender)?;
        let receiving = restore_chain(&snapshot.receiving, StepKind::Receiver)?;
        let mut session = Self {
            connect_id: snapshot.connect_id,
            role: snapshot.role,
            state: SessionState::Established,
            config,
            max_skip: DEFAULT_MAX_SKIP,
            root_key: None,
            sending: Some(sending),
            receiving: Some(receiving),
            pending_dh: None,
            peer_dh_public: Some(snapshot.peer_dh_public),
            peer_bundle: snapshot.peer_bundle.clone(),
            retired: None,
            replay: ReplayWindow::new(snapshot.replay_window),
            nonce_counter: snapshot.nonce_counter,
            nonce_prefix: snapshot.nonce_prefix,
            metadata_keys: VecDeque::new(),
            send_rekey_pending: snapshot.send_rekey_pending,
            advertise_dh: snapshot.advertise_dh,
            last_ratchet_at: snapshot.last_ratchet_at,
        };
        session.replay.restore(snapshot.replay_seen.iter().copied());
        let metadata = primitives::hkdf_expand(&root, INFO_METADATA, 32)?;
        session.metadata_keys.push_front(metadata);
        session.root_key = Some(root);
        Ok(session)
    }
}

/// One DH ratchet derivation:
///   PRK = HKDF-Extract(salt = root, ikm = dh)
///   HKDF-Expand(PRK, "ratchet", 96) → root ∥ chainA ∥ chainB
fn ratchet_kdf(
    root: &SecretBuffer,
    dh: &SecretBuffer,
) -> Result<(SecretBuffer, SecretBuffer, SecretBuffer), ProtocolError> {
    let prk = primitives::hkdf_extract(Some(root.read()), dh.read())?;
    let mut okm = SecretBuffer::zeroed(96)?;
    primitives::hkdf_expand_into(&prk, INFO_RATCHET, okm.write())?;
    let bytes = okm.read();
    let new_root = SecretBuffer::from_slice(&bytes[..32])?;
    let chain_a = SecretBuffer::from_slice(&bytes[32..64])?;
    let chain_b = SecretBuffer::from_slice(&bytes[64..96])?;
    Ok((new_root, chain_a, chain_b))
}

// ── Snapshot types ───────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub chain_key: Vec<u8>,
    pub current_index: u32,
    pub dh_secret: Option<Vec<u8>>,
    pub dh_public: Option<[u8; 32]>,
    pub cached_keys: Vec<(u32, Vec<u8>)>,
    pub cache_window: u32,
}

impl Drop for ChainSnapshot {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        if let Some(secret) = self.dh_secret.as_mut() {
            secret.zeroize();
        }
        for (_, key) in self.cached_keys.iter_mut() {
            key.zeroize();
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connect_id: u32,
    pub role: Role,
    pub root_key: Vec<u8>,
    pub sending: ChainSnapshot,
    pub receiving: ChainSnapshot,
    pub peer_dh_public: [u8; 32],
    pub peer_bundle: Option<PublicBundle>,
    pub nonce_counter: u64,
    pub nonce_prefix: [u8; 4],
    pub replay_window: u32,
    pub replay_seen: Vec<([u8; 12], u32)>,
    pub send_rekey_pending: bool,
    pub advertise_dh: bool,
    pub last_ratchet_at: DateTime<Utc>,
}

impl Drop for SessionSnapshot {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

fn chain_snapshot(chain: &ChainStep) -> ChainSnapshot {
    ChainSnapshot {
        chain_key: chain.chain_key().read().to_vec(),
        current_index: chain.current_index(),
        dh_secret: chain.dh_secret().map(|s| s.read().to_vec()),
        dh_public: chain.dh_public().copied(),
        cached_keys: chain
            .cached_entries()
            .map(|(i, k)| (i, k.read().to_vec()))
            .collect(),
        cache_window: chain.cache_window(),
    }
}

fn restore_chain(snapshot: &ChainSnapshot, kind: StepKind) -> Result<ChainStep, ProtocolError> {
    let chain_key = SecretBuffer::from_slice(&snapshot.chain_key)?;
    let dh = match (&snapshot.dh_secret, &snapshot.dh_public) {
        (Some(secret), Some(public)) => Some((SecretBuffer::from_slice(secret)?, *public)),
        (None, None) => None,
        _ => {
            return Err(ProtocolError::InvalidInput(
                "chain snapshot must carry both DH halves or neither".into(),
            ))
        }
    };
    let mut chain = ChainStep::create(kind, chain_key, dh, snapshot.cache_window)?;
    let mut cache = BTreeMap::new();
    for (index, key) in &snapshot.cached_keys {
        cache.insert(*index, SecretBuffer::from_slice(key)?);
    }
    chain.restore_cache(cache, snapshot.current_index);
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (RatchetSession, RatchetSession) {
        let mut alice = RatchetSession::create(7, true, RatchetConfig::default()).unwrap();
        let mut bob = RatchetSession::create(7, false, RatchetConfig::default()).unwrap();
        let alice_pub = alice.sender_dh_public().unwrap();
        let bob_pub = bob.sender_dh_public().unwrap();
        let root = SecretBuffer::from_slice(&[42u8; 32]).unwrap();
        let now = Utc::now();
        alice
            .finalize_chain_and_dh_keys(root.try_clone().unwrap(), bob_pub, now)
            .unwrap();
        bob.finalize_chain_and_dh_keys(root, alice_pub, now).unwrap();
        (alice, bob)
    }

    fn recv_key(session: &mut RatchetSession, index: u32) -> [u8; 32] {
        match session.process_received_message(index).unwrap() {
            KeyAccess::Cached => session.with_recv_key(index, |k| *k).unwrap(),
            KeyAccess::Staged(staged) => {
                let key = staged.with_target_key(|k| *k).unwrap();
                session.commit_received_message(staged);
                key
            }
        }
    }

    #[test]
    fn finalize_seeds_matching_chains_both_directions() {
        let (mut alice, mut bob) = established_pair();
        let now = Utc::now();

        let step = alice.prepare_next_send_message(now).unwrap();
        assert_eq!(step.index, 1);
        assert!(step.include_dh, "first message after finalize advertises");
        let alice_key = alice.with_send_key(1, |k| *k).unwrap();
        assert_eq!(recv_key(&mut bob, 1), alice_key);

        let step = bob.prepare_next_send_message(now).unwrap();
        assert_eq!(step.index, 1);
        let bob_key = bob.with_send_key(1, |k| *k).unwrap();
        assert_eq!(recv_key(&mut alice, 1), bob_key);
    }

    #[test]
    fn metadata_keys_match_after_finalize() {
        let (alice, bob) = established_pair();
        let a = alice.metadata_key().unwrap();
        let b = bob.metadata_key().unwrap();
        assert!(a.ct_eq(b.read()));
    }

    #[test]
    fn finalize_rejects_reflected_initial_key() {
        let mut alice = RatchetSession::create(1, true, RatchetConfig::default()).unwrap();
        let own = alice.sender_dh_public().unwrap();
        let root = SecretBuffer::from_slice(&[42u8; 32]).unwrap();
        match alice.finalize_chain_and_dh_keys(root, own, Utc::now()) {
            Err(ProtocolError::HandshakeRejected(_)) => {}
            other => panic!("expected HandshakeRejected, got {:?}", other.err()),
        }
    }

    #[test]
    fn sending_ratchet_syncs_with_receiving_ratchet() {
        let (mut alice, mut bob) = established_pair();
        let now = Utc::now();
        let old_alice_pub = alice.sender_dh_public().unwrap();

        alice.perform_sending_ratchet(now).unwrap();
        let new_alice_pub = alice.sender_dh_public().unwrap();
        assert_ne!(old_alice_pub, new_alice_pub);

        let step = alice.prepare_next_send_message(now).unwrap();
        assert!(step.include_dh);
        let alice_key = alice.with_send_key(step.index, |k| *k).unwrap();

        bob.perform_receiving_ratchet(new_alice_pub, now).unwrap();
        assert_eq!(recv_key(&mut bob, step.index), alice_key);
    }

    #[test]
    fn receiving_ratchet_is_idempotent() {
        let (mut alice, mut bob) = established_pair();
        let now = Utc::now();
        alice.perform_sending_ratchet(now).unwrap();
        let new_pub = alice.sender_dh_public().unwrap();

        bob.perform_receiving_ratchet(new_pub, now).unwrap();
        let root_after_first = bob.snapshot().unwrap().root_key.clone();
        bob.perform_receiving_ratchet(new_pub, now).unwrap();
        let root_after_second = bob.snapshot().unwrap().root_key.clone();
        assert_eq!(root_after_first, root_after_second);
    }

    #[test]
    fn receiving_ratchet_rejects_our_own_key() {
        let (_, mut bob) = established_pair();
        let own = bob.sender_dh_public().unwrap();
        match bob.perform_receiving_ratchet(own, Utc::now()) {
            Err(ProtocolError::HandshakeRejected(_)) => {}
            other => panic!("expected HandshakeRejected, got {:?}", other.err()),
        }
    }

    #[test]
    fn ratchet_replaces_root_and_chain_keys() {
        let (mut alice, _) = established_pair();
        let before = alice.snapshot().unwrap();
        alice.perform_sending_ratchet(Utc::now()).unwrap();
        let after = alice.snapshot().unwrap();
        assert_ne!(before.root_key, after.root_key);
        assert_ne!(before.sending.chain_key, after.sending.chain_key);
    }

    #[test]
    fn nonce_exhaustion_forces_a_ratchet() {
        let (mut alice, _) = established_pair();
        let now = Utc::now();
        alice.nonce_counter = u64::MAX;
        let step = alice.prepare_next_send_message(now).unwrap();
        assert!(step.ratcheted, "exhausted counter must force a DH ratchet");
        assert_eq!(step.index, 1);
        let nonce = alice.generate_next_nonce().unwrap();
        assert_eq!(&nonce[4..], &0u64.to_be_bytes());
    }

    #[test]
    fn nonces_are_prefix_plus_monotone_counter() {
        let (mut alice, _) = established_pair();
        let first = alice.generate_next_nonce().unwrap();
        let second = alice.generate_next_nonce().unwrap();
        assert_eq!(first[..4], second[..4]);
        assert_eq!(&first[4..], &0u64.to_be_bytes());
        assert_eq!(&second[4..], &1u64.to_be_bytes());
    }

    #[test]
    fn fresh_and_terminated_states_are_enforced() {
        let mut fresh = RatchetSession::create(1, true, RatchetConfig::default()).unwrap();
        assert!(matches!(
            fresh.prepare_next_send_message(Utc::now()),
            Err(ProtocolError::InvalidInput(_))
        ));

        let (mut alice, _) = established_pair();
        alice.terminate();
        assert!(matches!(
            alice.prepare_next_send_message(Utc::now()),
            Err(ProtocolError::Terminated)
        ));
        assert!(matches!(
            alice.process_received_message(1),
            Err(ProtocolError::Terminated)
        ));
    }

    #[test]
    fn snapshot_restore_resumes_the_conversation() {
        let (mut alice, mut bob) = established_pair();
        let now = Utc::now();
        let step = alice.prepare_next_send_message(now).unwrap();
        let key = alice.with_send_key(step.index, |k| *k).unwrap();
        assert_eq!(recv_key(&mut bob, step.index), key);

        let snapshot = alice.snapshot().unwrap();
        let mut restored = RatchetSession::restore(&snapshot, RatchetConfig::default()).unwrap();
        let step = restored.prepare_next_send_message(now).unwrap();
        assert_eq!(step.index, 2);
        let key = restored.with_send_key(2, |k| *k).unwrap();
        assert_eq!(recv_key(&mut bob, 2), key);
    }
}
