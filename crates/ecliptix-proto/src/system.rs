//! Top-level protocol facade.
//!
//! `ProtocolSystem` owns one identity and one ratchet session behind a
//! single exclusive lock; every mutating operation (handshake steps,
//! envelope production and consumption, termination) holds the lock for
//! its full duration so ratchet steps stay atomic. The adaptive policy
//! publishes config snapshots from outside the lock.
//!
//! External collaborators — event sinks, metrics, circuit breakers — see
//! the session only through the observer traits below; they are notified
//! after the lock is released and can never re-enter session state.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use zeroize::Zeroizing;

use ecliptix_crypto::identity::IdentityKeys;
use ecliptix_crypto::policy::{AdaptivePolicy, LoadClass, RatchetConfig};
use ecliptix_crypto::ratchet::{RatchetSession, SessionSnapshot, SessionState};
use ecliptix_crypto::secret::constant_time_eq;
use ecliptix_crypto::ProtocolError;

use crate::bundle::{ExchangeState, PubKeyExchange, EXCHANGE_TYPE_INITIAL_SESSION};
use crate::codec;
use crate::envelope::SecureEnvelope;

/// Which side of a DH ratchet step fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatchetDirection {
    Sending,
    Receiving,
}

/// Session lifecycle notifications. All methods default to no-ops.
pub trait ProtocolEventHandler: Send + Sync {
    fn handshake_completed(&self, _connect_id: u32) {}
    fn dh_ratchet_performed(&self, _connect_id: u32, _direction: RatchetDirection) {}
    fn session_terminated(&self, _connect_id: u32) {}
}

/// Generic external observer (metrics collector, circuit breaker). Its
/// policies cannot affect cryptographic state.
pub trait ProtocolObserver: Send + Sync {
    fn envelope_produced(&self, _payload_bytes: usize) {}
    fn envelope_consumed(&self, _payload_bytes: usize) {}
    fn envelope_rejected(&self, _error: &ProtocolError) {}
}

/// How the session's ratchet cadence is configured.
pub enum ConfigMode {
    /// One fixed config for the session lifetime.
    Fixed(RatchetConfig),
    /// Follow the adaptive policy's published snapshot.
    Adaptive,
}

struct Inner {
    identity: IdentityKeys,
    session: RatchetSession,
}

/// One end of an Ecliptix connection: handshake, envelopes, teardown.
pub struct ProtocolSystem {
    inner: Mutex<Inner>,
    policy: AdaptivePolicy,
    adaptive: bool,
    events: RwLock<Option<Arc<dyn ProtocolEventHandler>>>,
    observer: RwLock<Option<Arc<dyn ProtocolObserver>>>,
    connect_id: u32,
}

impl ProtocolSystem {
    pub fn new(
        identity: IdentityKeys,
        connect_id: u32,
        is_initiator: bool,
        config: ConfigMode,
    ) -> Result<Self, ProtocolError> {
        let (initial, adaptive) = match config {
            ConfigMode::Fixed(cfg) => (cfg, false),
            ConfigMode::Adaptive => (RatchetConfig::default(), true),
        };
        let session = RatchetSession::create(connect_id, is_initiator, initial)?;
        Ok(Self {
            inner: Mutex::new(Inner { identity, session }),
            policy: AdaptivePolicy::new(),
            adaptive,
            events: RwLock::new(None),
            observer: RwLock::new(None),
            connect_id,
        })
    }

    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    pub fn set_event_handler(&self, handler: Arc<dyn ProtocolEventHandler>) {
        *self.events.write() = Some(handler);
    }

    pub fn set_observer(&self, observer: Arc<dyn ProtocolObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn adaptive_policy(&self) -> &AdaptivePolicy {
        &self.policy
    }

    pub fn load_class(&self) -> LoadClass {
        self.policy.load_class()
    }

    // ── Handshake ────────────────────────────────────────────────────────

    /// Initiator: emit the Init message carrying our bundle (with an
    /// ephemeral key) and our initial ratchet DH public.
    pub fn begin_handshake(&self) -> Result<PubKeyExchange, ProtocolError> {
        let mut inner = self.inner.lock();
        if inner.session.state() != SessionState::Fresh {
            return Err(ProtocolError::InvalidInput(
                "handshake already performed".into(),
            ));
        }
        // A pinned ephemeral (deterministic provisioning) is kept; one is
        // generated otherwise.
        if !inner.identity.has_ephemeral() {
            inner.identity.generate_ephemeral()?;
        }
        let bundle = inner.identity.create_public_bundle();
        let initial_dh_public = inner.session.sender_dh_public()?;
        Ok(PubKeyExchange {
            state: ExchangeState::Init,
            exchange_type: EXCHANGE_TYPE_INITIAL_SESSION,
            bundle,
            initial_dh_public,
        })
    }

    /// Responder: process an Init, derive the X3DH root key, finalize the
    /// session, and emit the Ack.
    pub fn accept_handshake(
        &self,
        init: &PubKeyExchange,
    ) -> Result<PubKeyExchange, ProtocolError> {
        if init.state != ExchangeState::Init {
            return Err(ProtocolError::InvalidInput(
                "expected an Init exchange message".into(),
            ));
        }
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let our_initial_dh = inner.session.sender_dh_public()?;
        if constant_time_eq(&init.initial_dh_public, &our_initial_dh) {
            return Err(ProtocolError::HandshakeRejected(
                "peer echoed our initial DH public key".into(),
            ));
        }
        // Snapshot the Ack bundle before X3DH consumes a one-time pre-key:
        // the initiator must see the pool exactly as it was used.
        let ack_bundle = inner.identity.create_public_bundle();
        let root_key = inner.identity.x3dh_respond(&init.bundle)?;
        inner.session.set_peer_bundle(init.bundle.clone());
        inner
            .session
            .finalize_chain_and_dh_keys(root_key, init.initial_dh_public, now)?;
        drop(inner);

        tracing::info!(connect_id = self.connect_id, "handshake accepted");
        self.notify(|events| events.handshake_completed(self.connect_id));
        Ok(PubKeyExchange {
            state: ExchangeState::Ack,
            exchange_type: init.exchange_type,
            bundle: ack_bundle,
            initial_dh_public: our_initial_dh,
        })
    }

    /// Initiator: process the Ack and finalize the session.
    pub fn complete_handshake(&self, ack: &PubKeyExchange) -> Result<(), ProtocolError> {
        if ack.state != ExchangeState::Ack {
            return Err(ProtocolError::InvalidInput(
                "expected an Ack exchange message".into(),
            ));
        }
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let our_initial_dh = inner.session.sender_dh_public()?;
        if constant_time_eq(&ack.initial_dh_public, &our_initial_dh) {
            return Err(ProtocolError::HandshakeRejected(
                "peer echoed our initial DH public key".into(),
            ));
        }
        let root_key = inner.identity.x3dh_initiate(&ack.bundle)?;
        inner.session.set_peer_bundle(ack.bundle.clone());
        inner
            .session
            .finalize_chain_and_dh_keys(root_key, ack.initial_dh_public, now)?;
        drop(inner);

        tracing::info!(connect_id = self.connect_id, "handshake completed");
        self.notify(|events| events.handshake_completed(self.connect_id));
        Ok(())
    }

    // ── Envelopes ────────────────────────────────────────────────────────

    /// Encrypt `plaintext` into the next envelope of the sending chain.
    pub fn produce_envelope(&self, plaintext: &[u8]) -> Result<SecureEnvelope, ProtocolError> {
        let now = Utc::now();
        if self.adaptive {
            self.policy.maybe_refresh(now);
        }
        let result = {
            let mut inner = self.inner.lock();
            if self.adaptive {
                inner.session.set_config(self.policy.current_config());
            }
            let Inner { identity, session } = &mut *inner;
            codec::produce_envelope(identity, session, plaintext, now)
        };
        match result {
            Ok((envelope, ratcheted)) => {
                if ratcheted {
                    self.notify(|events| {
                        events.dh_ratchet_performed(self.connect_id, RatchetDirection::Sending)
                    });
                }
                self.observe(|observer| observer.envelope_produced(envelope.payload.len()));
                Ok(envelope)
            }
            Err(e) => {
                self.observe(|observer| observer.envelope_rejected(&e));
                Err(e)
            }
        }
    }

    /// Authenticate and decrypt an incoming envelope.
    pub fn process_envelope(
        &self,
        envelope: &SecureEnvelope,
    ) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
        let now = Utc::now();
        self.policy.record_arrival(now);
        if self.adaptive {
            self.policy.maybe_refresh(now);
        }
        let result = {
            let mut inner = self.inner.lock();
            if self.adaptive {
                inner.session.set_config(self.policy.current_config());
            }
            let Inner { identity, session } = &mut *inner;
            codec::consume_envelope(identity, session, envelope, now)
        };
        match result {
            Ok((plaintext, ratcheted)) => {
                if ratcheted {
                    self.notify(|events| {
                        events.dh_ratchet_performed(self.connect_id, RatchetDirection::Receiving)
                    });
                }
                self.observe(|observer| observer.envelope_consumed(envelope.payload.len()));
                Ok(plaintext)
            }
            Err(e) => {
                tracing::warn!(connect_id = self.connect_id, error = %e, "envelope rejected");
                self.observe(|observer| observer.envelope_rejected(&e));
                Err(e)
            }
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn sending_index(&self) -> u32 {
        self.inner.lock().session.sending_index()
    }

    pub fn receiving_index(&self) -> u32 {
        self.inner.lock().session.receiving_index()
    }

    pub fn identity_fingerprint(&self) -> String {
        self.inner.lock().identity.fingerprint()
    }

    /// Abstract session snapshot; the embedder encrypts it at rest.
    pub fn session_snapshot(&self) -> Result<SessionSnapshot, ProtocolError> {
        self.inner.lock().session.snapshot()
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Wipe all session key material; subsequent operations fail with
    /// `Terminated`.
    pub fn terminate(&self) {
        self.inner.lock().session.terminate();
        self.notify(|events| events.session_terminated(self.connect_id));
    }

    fn notify(&self, f: impl FnOnce(&Arc<dyn ProtocolEventHandler>)) {
        if let Some(events) = self.events.read().as_ref() {
            f(events);
        }
    }

    fn observe(&self, f: impl FnOnce(&Arc<dyn ProtocolObserver>)) {
        if let Some(observer) = self.observer.read().as_ref() {
            f(observer);
        }
    }
}
