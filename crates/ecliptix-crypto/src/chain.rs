//! One direction of the Double Ratchet: a symmetric chain.
//!
//! Chain state (non-negotiable separation):
//!   CK — chain key, advanced once per message via HKDF-Expand
//!   MK — message key, derived from CK, cached by index, used at most once
//!
//! Derivation is staged: [`ChainStep::stage`] computes the new chain key and
//! every intervening message key into temporaries, and only
//! [`ChainStep::commit`] makes them visible. A failed authentication after
//! staging therefore never advances the chain — the staged secrets wipe
//! themselves on drop.

use std::collections::BTreeMap;

use crate::error::ProtocolError;
use crate::primitives::{self, INFO_CHAIN_KEY, INFO_MESSAGE_KEY};
use crate::secret::SecretBuffer;

/// Default message-key cache window (most-recent plus skipped keys).
pub const DEFAULT_CACHE_WINDOW: u32 = 1000;

/// Hard ceiling on how far ahead of the current index a single request may
/// reach, bounding the work a hostile index can demand.
pub const MAX_DERIVE_AHEAD: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Sender,
    Receiver,
}

/// One symmetric chain: chain key, index, optional DH slot, key cache.
pub struct ChainStep {
    kind: StepKind,
    chain_key: SecretBuffer,
    current_index: u32,
    dh_secret: Option<SecretBuffer>,
    dh_public: Option<[u8; 32]>,
    cache: BTreeMap<u32, SecretBuffer>,
    cache_window: u32,
}

/// Keys derived but not yet committed: the advanced chain key plus every
/// message key between the old index and `target`.
pub struct StagedAdvance {
    new_chain_key: SecretBuffer,
    derived: Vec<(u32, SecretBuffer)>,
    target: u32,
}

impl StagedAdvance {
    pub fn target(&self) -> u32 {
        self.target
    }

    /// Lend the staged target key without committing anything.
    pub fn with_target_key<R>(
        &self,
        f: impl FnOnce(&[u8; 32]) -> R,
    ) -> Result<R, ProtocolError> {
        let (_, key) = self
            .derived
            .last()
            .ok_or(ProtocolError::UnknownKeyIndex(self.target))?;
        Ok(f(key.as_key32()?))
    }
}

/// Result of a key lookup: either already cached or freshly staged.
pub enum KeyAccess {
    Cached,
    Staged(StagedAdvance),
}

impl ChainStep {
    /// Create a chain. `chain_key` must be 32 bytes; a DH slot is either
    /// fully present (secret and public) or absent — the tuple makes half a
    /// pair unrepresentable.
    pub fn create(
        kind: StepKind,
        chain_key: SecretBuffer,
        dh: Option<(SecretBuffer, [u8; 32])>,
        cache_window: u32,
    ) -> Result<Self, ProtocolError> {
        if chain_key.len() != 32 {
            return Err(ProtocolError::InvalidInput(format!(
                "chain key must be 32 bytes, got {}",
                chain_key.len()
            )));
        }
        if cache_window == 0 {
            return Err(ProtocolError::InvalidInput(
                "cache window must be non-zero".into(),
            ));
        }
        let (dh_secret, dh_public) = match dh {
            Some((secret, public)) => (Some(secret), Some(public)),
            None => (None, None),
        };
        Ok(Self {
            kind,
            chain_key,
            current_index: 0,
            dh_secret,
            dh_public,
            cache: BTreeMap::new(),
            cache_window,
        })
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    pub fn dh_public(&self) -> Option<&[u8; 32]> {
        self.dh_public.as_ref()
    }

    pub fn dh_secret(&self) -> Option<&SecretBuffer> {
        self.dh_secret.as_ref()
    }

    pub fn cache_window(&self) -> u32 {
        self.cache_window
    }

    /// Advance by exactly one index (sending side) and cache the key.
    pub fn advance(&mut self) -> Result<u32, ProtocolError> {
        let target = self
            .current_index
            .checked_add(1)
            .ok_or(ProtocolError::IndexTooFarAhead {
                requested: u32::MAX,
                current: self.current_index,
            })?;
        let staged = self.stage_unchecked(target)?;
        self.commit(staged);
        Ok(target)
    }

    /// Ensure the key for `target_index` is cached, deriving (and caching)
    /// every skipped key on the way. `max_ahead` bounds the reach.
    pub fn get_or_derive(&mut self, target_index: u32, max_ahead: u32) -> Result<(), ProtocolError> {
        match self.stage(target_index, max_ahead)? {
            KeyAccess::Cached => Ok(()),
            KeyAccess::Staged(staged) => {
                self.commit(staged);
                Ok(())
            }
        }
    }

    /// Derive-without-consuming up to `target_index`; identical to
    /// [`ChainStep::get_or_derive`] by construction.
    pub fn skip_keys_until(&mut self, target_index: u32, max_ahead: u32) -> Result<(), ProtocolError> {
        self.get_or_derive(target_index, max_ahead)
    }

    /// Stage the derivation for `target_index` without mutating the chain.
    pub fn stage(&self, target_index: u32, max_ahead: u32) -> Result<KeyAccess, ProtocolError> {
        if self.cache.contains_key(&target_index) {
            return Ok(KeyAccess::Cached);
        }
        if target_index <= self.current_index {
            return Err(ProtocolError::IndexInPast(target_index));
        }
        let reach = target_index - self.current_index;
        if reach > max_ahead.min(MAX_DERIVE_AHEAD) {
            return Err(ProtocolError::IndexTooFarAhead {
                requested: target_index,
                current: self.current_index,
            });
        }
        self.stage_unchecked(target_index).map(KeyAccess::Staged)
    }

    fn stage_unchecked(&self, target_index: u32) -> Result<StagedAdvance, ProtocolError> {
        let mut ck = self.chain_key.try_clone()?;
        let mut derived = Vec::with_capacity((target_index - self.current_index) as usize);
        for index in self.current_index + 1..=target_index {
            let (next_ck, mk) = symmetric_step(&ck)?;
            ck = next_ck;
            derived.push((index, mk));
        }
        Ok(StagedAdvance {
            new_chain_key: ck,
            derived,
            target: target_index,
        })
    }

    /// Make a staged derivation visible: overwrite the chain key, insert the
    /// derived keys, bump the index, then prune. Pruning runs after the
    /// insertions so the freshly derived target is always retained.
    pub fn commit(&mut self, staged: StagedAdvance) {
        self.chain_key = staged.new_chain_key;
        for (index, key) in staged.derived {
            self.cache.insert(index, key);
        }
        self.current_index = self.current_index.max(staged.target);
        self.prune();
    }

    /// Lend a cached message key read-only.
    pub fn with_key<R>(
        &self,
        index: u32,
        f: impl FnOnce(&[u8; 32]) -> R,
    ) -> Result<R, ProtocolError> {
        let key = self
            .cache
            .get(&index)
            .ok_or(ProtocolError::UnknownKeyIndex(index))?;
        Ok(f(key.as_key32()?))
    }

    pub fn is_cached(&self, index: u32) -> bool {
        self.cache.contains_key(&index)
    }

    /// Rotate the chain for a DH ratchet: wipe the cache, install the new
    /// chain key, reset the index, optionally replace the DH slot.
    pub fn update_after_dh_ratchet(
        &mut self,
        new_chain_key: SecretBuffer,
        dh: Option<(SecretBuffer, [u8; 32])>,
    ) -> Result<(), ProtocolError> {
        if new_chain_key.len() != 32 {
            return Err(ProtocolError::InvalidInput(format!(
                "chain key must be 32 bytes, got {}",
                new_chain_key.len()
            )));
        }
        self.cache.clear();
        self.chain_key = new_chain_key;
        self.current_index = 0;
        if let Some((secret, public)) = dh {
            self.dh_secret = Some(secret);
            self.dh_public = Some(public);
        }
        Ok(())
    }

    pub(crate) fn restore_cache(&mut self, cache: BTreeMap<u32, SecretBuffer>, index: u32) {
        self.cache = cache;
        self.current_index = index;
    }

    pub(crate) fn chain_key(&self) -> &SecretBuffer {
        &self.chain_key
    }

    pub(crate) fn cached_entries(&self) -> impl Iterator<Item = (u32, &SecretBuffer)> {
        self.cache.iter().map(|(i, k)| (*i, k))
    }

    fn prune(&mut self) {
        let floor = self
            .current_index
            .saturating_sub(self.cache_window.saturating_sub(1));
        self.cache = self.cache.split_off(&floor);
    }
}

/// One symmetric ratchet iteration:
///   MK  = HKDF-Expand(prk = CK, info = "msg",   32)
///   CK' = HKDF-Expand(prk = CK, info = "chain", 32)
fn symmetric_step(ck: &SecretBuffer) -> Result<(SecretBuffer, SecretBuffer), ProtocolError> {
    let mk = primitives::hkdf_expand(ck, INFO_MESSAGE_KEY, 32)?;
    let next_ck = primitives::hkdf_expand(ck, INFO_CHAIN_KEY, 32)?;
    Ok((next_ck, mk))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(kind: StepKind, window: u32) -> ChainStep {
        ChainStep::create(
            kind,
            SecretBuffer::from_slice(&[0x11u8; 32]).unwrap(),
            None,
            window,
        )
        .unwrap()
    }

    #[test]
    fn advance_is_monotone_and_caches() {
        let mut c = chain(StepKind::Sender, 10);
        assert_eq!(c.advance().unwrap(), 1);
        assert_eq!(c.advance().unwrap(), 2);
        assert_eq!(c.current_index(), 2);
        assert!(c.is_cached(1));
        assert!(c.is_cached(2));
    }

    #[test]
    fn cached_keys_are_stable_across_calls() {
        let mut c = chain(StepKind::Receiver, 10);
        c.get_or_derive(3, 100).unwrap();
        let first = c.with_key(2, |k| *k).unwrap();
        let second = c.with_key(2, |k| *k).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn same_seed_chains_derive_identical_keys() {
        let mut a = chain(StepKind::Sender, 10);
        let mut b = chain(StepKind::Receiver, 10);
        let ia = a.advance().unwrap();
        b.get_or_derive(1, 100).unwrap();
        let ka = a.with_key(ia, |k| *k).unwrap();
        let kb = b.with_key(1, |k| *k).unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn past_uncached_index_fails() {
        let mut c = chain(StepKind::Receiver, 2);
        c.get_or_derive(5, 100).unwrap();
        // Window of 2 keeps indices 4 and 5 only.
        assert!(c.is_cached(5));
        assert!(c.is_cached(4));
        assert!(!c.is_cached(3));
        match c.stage(3, 100) {
            Err(ProtocolError::IndexInPast(3)) => {}
            other => panic!("expected IndexInPast, got {:?}", other.err()),
        }
    }

    #[test]
    fn too_far_ahead_is_bounded() {
        let c = chain(StepKind::Receiver, 10);
        match c.stage(101, 100) {
            Err(ProtocolError::IndexTooFarAhead { requested: 101, current: 0 }) => {}
            other => panic!("expected IndexTooFarAhead, got {:?}", other.err()),
        }
        // The hard ceiling holds even with a permissive per-call bound.
        match c.stage(MAX_DERIVE_AHEAD + 1, u32::MAX) {
            Err(ProtocolError::IndexTooFarAhead { .. }) => {}
            other => panic!("expected IndexTooFarAhead, got {:?}", other.err()),
        }
    }

    #[test]
    fn boundary_at_max_ahead_succeeds() {
        let mut c = chain(StepKind::Receiver, 2000);
        c.get_or_derive(100, 100).unwrap();
        assert_eq!(c.current_index(), 100);
    }

    #[test]
    fn staging_does_not_advance_until_commit() {
        let mut c = chain(StepKind::Receiver, 10);
        let staged = match c.stage(2, 100).unwrap() {
            KeyAccess::Staged(s) => s,
            KeyAccess::Cached => panic!("unexpected cache hit"),
        };
        assert_eq!(c.current_index(), 0);
        assert!(!c.is_cached(1));
        staged.with_target_key(|_| ()).unwrap();
        assert_eq!(c.current_index(), 0);
        c.commit(staged);
        assert_eq!(c.current_index(), 2);
        assert!(c.is_cached(1));
        assert!(c.is_cached(2));
    }

    #[test]
    fn ratchet_update_resets_chain() {
        let mut c = chain(StepKind::Receiver, 10);
        c.get_or_derive(4, 100).unwrap();
        let old_key = c.with_key(4, |k| *k).unwrap();
        c.update_after_dh_ratchet(SecretBuffer::from_slice(&[0x22u8; 32]).unwrap(), None)
            .unwrap();
        assert_eq!(c.current_index(), 0);
        assert!(!c.is_cached(4));
        c.get_or_derive(4, 100).unwrap();
        let new_key = c.with_key(4, |k| *k).unwrap();
        assert_ne!(old_key, new_key);
    }

    #[test]
    fn prune_retains_newest_window() {
        let mut c = chain(StepKind::Receiver, 3);
        c.get_or_derive(10, 100).unwrap();
        assert!(c.is_cached(10));
        assert!(c.is_cached(9));
        assert!(c.is_cached(8));
        assert!(!c.is_cached(7));
    }
}
