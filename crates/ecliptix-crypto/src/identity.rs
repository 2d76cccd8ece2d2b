//! Identity key management and X3DH key agreement.
//!
//! Each party owns one long-term Ed25519 signing identity, an independent
//! X25519 identity for key agreement, a signed pre-key (X25519, public half
//! signed by the Ed25519 identity), a small pool of one-time pre-keys, and
//! a current ephemeral pair. All private halves live in [`SecretBuffer`]s.
//!
//! X3DH (initiator side, responder mirrors each term):
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)   [first listed one-time pre-key, if any]
//!   SK  = HKDF-Expand(HKDF-Extract(0, DH1 ∥ DH2 ∥ DH3 [∥ DH4]), info, 32)
//!
//! The SPK signature MUST verify before any DH is computed. All DH outputs
//! and the concatenated input keying material are wiped after use.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::ProtocolError;
use crate::kdf::{self, MembershipId, StretchProfile, SubSeedContext};
use crate::primitives::{
    self, ED25519_PUBLIC_LEN, ED25519_SIGNATURE_LEN, INFO_X3DH, X25519_KEY_LEN,
};
use crate::secret::SecretBuffer;

/// Public half of a one-time pre-key, as published in a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public: [u8; X25519_KEY_LEN],
}

/// Wire-exchanged public key bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicBundle {
    /// Ed25519 identity (signature verification key).
    pub identity_ed25519: [u8; ED25519_PUBLIC_LEN],
    /// X25519 identity (key agreement).
    pub identity_x25519: [u8; X25519_KEY_LEN],
    pub signed_prekey_id: u32,
    pub signed_prekey_public: [u8; X25519_KEY_LEN],
    #[serde(with = "signature_serde")]
    pub signed_prekey_signature: [u8; ED25519_SIGNATURE_LEN],
    /// Present on the initiator's bundle.
    pub ephemeral_x25519: Option<[u8; X25519_KEY_LEN]>,
    /// Ordered; the first entry is the one a session consumes.
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

impl PublicBundle {
    /// Reject bundles carrying a zero or small-order X25519 key anywhere.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        primitives::validate_x25519_public(&self.identity_x25519)?;
        primitives::validate_x25519_public(&self.signed_prekey_public)?;
        if let Some(ephemeral) = &self.ephemeral_x25519 {
            primitives::validate_x25519_public(ephemeral)?;
        }
        for otpk in &self.one_time_prekeys {
            primitives::validate_x25519_public(&otpk.public)?;
        }
        Ok(())
    }
}

struct OneTimePreKey {
    id: u32,
    secret: SecretBuffer,
    public: [u8; X25519_KEY_LEN],
}

/// Exclusive owner of a party's long-term and session key material.
pub struct IdentityKeys {
    ed_secret: SecretBuffer,
    ed_public: [u8; ED25519_PUBLIC_LEN],
    x_secret: SecretBuffer,
    x_public: [u8; X25519_KEY_LEN],
    spk_id: u32,
    spk_secret: SecretBuffer,
    spk_public: [u8; X25519_KEY_LEN],
    spk_signature: [u8; ED25519_SIGNATURE_LEN],
    one_time: Vec<OneTimePreKey>,
    ephemeral: Option<(SecretBuffer, [u8; X25519_KEY_LEN])>,
}

impl IdentityKeys {
    /// Generate a fresh identity with `one_time_count` one-time pre-keys.
    pub fn generate(one_time_count: u32) -> Result<Self, ProtocolError> {
        let ed_secret = SecretBuffer::random(32)?;
        let x_seed = SecretBuffer::random(32)?;
        let spk_seed = SecretBuffer::random(32)?;
        let mut keys = Self::from_seed_material(
            ed_secret.as_key32()?,
            x_seed.as_key32()?,
            spk_seed.as_key32()?,
            1,
        )?;
        for _ in 0..one_time_count {
            keys.generate_one_time_prekey()?;
        }
        Ok(keys)
    }

    /// Build the identity deterministically from three 32-byte seeds.
    pub fn from_seed_material(
        ed_seed: &[u8; 32],
        x_seed: &[u8; 32],
        spk_seed: &[u8; 32],
        spk_id: u32,
    ) -> Result<Self, ProtocolError> {
        let ed_secret = SecretBuffer::from_slice(ed_seed)?;
        let ed_public = primitives::ed25519_public(&ed_secret)?;
        let x_secret = SecretBuffer::from_slice(x_seed)?;
        let x_public = primitives::x25519_public(&x_secret)?;
        let spk_secret = SecretBuffer::from_slice(spk_seed)?;
        let spk_public = primitives::x25519_public(&spk_secret)?;
        let spk_signature = primitives::ed25519_sign(&ed_secret, &spk_public)?;
        Ok(Self {
            ed_secret,
            ed_public,
            x_secret,
            x_public,
            spk_id,
            spk_secret,
            spk_public,
            spk_signature,
            one_time: Vec::new(),
            ephemeral: None,
        })
    }

    /// Derive the identity from a master key: Ed25519, X25519 identity and
    /// signed pre-key come from the keyed-BLAKE2b sub-seeds bound to the
    /// membership id.
    pub fn from_master_key(
        master_key: &SecretBuffer,
        membership_id: &MembershipId,
        version: u32,
        one_time_count: u32,
    ) -> Result<Self, ProtocolError> {
        let ed_seed = kdf::derive_sub_seed(master_key, membership_id, version, SubSeedContext::Ed25519)?;
        let x_seed = kdf::derive_sub_seed(master_key, membership_id, version, SubSeedContext::X25519)?;
        let spk_seed =
            kdf::derive_sub_seed(master_key, membership_id, version, SubSeedContext::SignedPreKey)?;
        let mut keys = Self::from_seed_material(
            ed_seed.as_key32()?,
            x_seed.as_key32()?,
            spk_seed.as_key32()?,
            1,
        )?;
        for _ in 0..one_time_count {
            keys.generate_one_time_prekey()?;
        }
        Ok(keys)
    }

    /// Stretch an export key into a master key and derive the identity from
    /// it in one step.
    pub fn from_export_key(
        export_key: &SecretBuffer,
        membership_id: &MembershipId,
        version: u32,
        profile: &StretchProfile,
        one_time_count: u32,
    ) -> Result<Self, ProtocolError> {
        let master = kdf::derive_master_key(export_key, membership_id, version, profile)?;
        Self::from_master_key(&master, membership_id, version, one_time_count)
    }

    pub fn ed25519_public(&self) -> &[u8; ED25519_PUBLIC_LEN] {
        &self.ed_public
    }

    pub fn identity_x25519_public(&self) -> &[u8; X25519_KEY_LEN] {
        &self.x_public
    }

    pub fn one_time_prekey_count(&self) -> usize {
        self.one_time.len()
    }

    pub fn has_ephemeral(&self) -> bool {
        self.ephemeral.is_some()
    }

    /// Sign arbitrary bytes with the Ed25519 identity.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; ED25519_SIGNATURE_LEN], ProtocolError> {
        primitives::ed25519_sign(&self.ed_secret, message)
    }

    /// Add a freshly generated one-time pre-key to the pool.
    pub fn generate_one_time_prekey(&mut self) -> Result<u32, ProtocolError> {
        let id = self.one_time.iter().map(|k| k.id).max().unwrap_or(0) + 1;
        let (secret, public) = primitives::generate_x25519_keypair()?;
        self.one_time.push(OneTimePreKey { id, secret, public });
        Ok(id)
    }

    /// Install a one-time pre-key from a fixed seed (deterministic
    /// provisioning).
    pub fn add_one_time_prekey_from_seed(
        &mut self,
        id: u32,
        seed: &[u8; 32],
    ) -> Result<(), ProtocolError> {
        if self.one_time.iter().any(|k| k.id == id) {
            return Err(ProtocolError::InvalidInput(format!(
                "one-time pre-key id {id} already present"
            )));
        }
        let secret = SecretBuffer::from_slice(seed)?;
        let public = primitives::x25519_public(&secret)?;
        self.one_time.push(OneTimePreKey { id, secret, public });
        Ok(())
    }

    /// Generate (and return the public half of) a fresh ephemeral pair,
    /// replacing — and thereby wiping — any previous one.
    pub fn generate_ephemeral(&mut self) -> Result<[u8; X25519_KEY_LEN], ProtocolError> {
        let pair = primitives::generate_x25519_keypair()?;
        let public = pair.1;
        self.ephemeral = Some(pair);
        Ok(public)
    }

    /// Install an ephemeral pair from a fixed seed.
    pub fn set_ephemeral_from_seed(
        &mut self,
        seed: &[u8; 32],
    ) -> Result<[u8; X25519_KEY_LEN], ProtocolError> {
        let secret = SecretBuffer::from_slice(seed)?;
        let public = primitives::x25519_public(&secret)?;
        self.ephemeral = Some((secret, public));
        Ok(public)
    }

    /// The bundle this party publishes. Includes the current ephemeral
    /// public when one exists (initiator side).
    pub fn create_public_bundle(&self) -> PublicBundle {
        PublicBundle {
            identity_ed25519: self.ed_public,
            identity_x25519: self.x_public,
            signed_prekey_id: self.spk_id,
            signed_prekey_public: self.spk_public,
            signed_prekey_signature: self.spk_signature,
            ephemeral_x25519: self.ephemeral.as_ref().map(|(_, public)| *public),
            one_time_prekeys: self
                .one_time
                .iter()
                .map(|k| OneTimePreKeyPublic { id: k.id, public: k.public })
                .collect(),
        }
    }

    /// Verify a remote bundle's signed-pre-key signature.
    pub fn verify_remote_spk_signature(bundle: &PublicBundle) -> Result<(), ProtocolError> {
        let valid = primitives::ed25519_verify(
            &bundle.identity_ed25519,
            &bundle.signed_prekey_public,
            &bundle.signed_prekey_signature,
        )?;
        if !valid {
            return Err(ProtocolError::HandshakeRejected(
                "signed pre-key signature does not verify".into(),
            ));
        }
        Ok(())
    }

    /// Initiator side of X3DH against the responder's bundle. The current
    /// ephemeral pair must have been generated first.
    pub fn x3dh_initiate(&self, peer: &PublicBundle) -> Result<SecretBuffer, ProtocolError> {
        peer.validate()?;
        Self::verify_remote_spk_signature(peer)?;
        let (ephemeral_secret, _) = self
            .ephemeral
            .as_ref()
            .ok_or_else(|| ProtocolError::InvalidInput("no ephemeral key generated".into()))?;

        let dh1 = primitives::x25519(&self.x_secret, &peer.signed_prekey_public)?;
        let dh2 = primitives::x25519(ephemeral_secret, &peer.identity_x25519)?;
        let dh3 = primitives::x25519(ephemeral_secret, &peer.signed_prekey_public)?;
        let dh4 = match peer.one_time_prekeys.first() {
            Some(otpk) => Some(primitives::x25519(ephemeral_secret, &otpk.public)?),
            None => None,
        };
        x3dh_kdf(dh1, dh2, dh3, dh4)
    }

    /// Responder side of X3DH against the initiator's bundle (which must
    /// carry an ephemeral). Consumes our first one-time pre-key when the
    /// pool is non-empty.
    pub fn x3dh_respond(&mut self, peer: &PublicBundle) -> Result<SecretBuffer, ProtocolError> {
        peer.validate()?;
        Self::verify_remote_spk_signature(peer)?;
        let peer_ephemeral = peer.ephemeral_x25519.ok_or_else(|| {
            ProtocolError::HandshakeRejected("initiator bundle lacks an ephemeral key".into())
        })?;

        let dh1 = primitives::x25519(&self.spk_secret, &peer.identity_x25519)?;
        let dh2 = primitives::x25519(&self.x_secret, &peer_ephemeral)?;
        let dh3 = primitives::x25519(&self.spk_secret, &peer_ephemeral)?;
        let dh4 = if self.one_time.is_empty() {
            None
        } else {
            let otpk = self.one_time.remove(0);
            Some(primitives::x25519(&otpk.secret, &peer_ephemeral)?)
        };
        x3dh_kdf(dh1, dh2, dh3, dh4)
    }

    /// Human-readable identity fingerprint: SHA-256 of the Ed25519 public,
    /// truncated to 20 bytes, hex in groups of four.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.ed_public)
    }
}

/// Fingerprint helper for any 32-byte public identity key.
pub fn fingerprint_of(public: &[u8; 32]) -> String {
    let digest = primitives::sha256(public);
    let hex = hex::encode(&digest[..20]);
    hex.as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).unwrap_or_default().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn x3dh_kdf(
    dh1: SecretBuffer,
    dh2: SecretBuffer,
    dh3: SecretBuffer,
    dh4: Option<SecretBuffer>,
) -> Result<SecretBuffer, ProtocolError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(4 * X25519_KEY_LEN));
    ikm.extend_from_slice(dh1.read());
    ikm.extend_from_slice(dh2.read());
    ikm.extend_from_slice(dh3.read());
    if let Some(dh4) = &dh4 {
        ikm.extend_from_slice(dh4.read());
    }
    let prk = primitives::hkdf_extract(Some(&[0u8; 32]), &ikm)?;
    primitives::hkdf_expand(&prk, INFO_X3DH, 32)
}

mod signature_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(sig: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(sig)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x3dh_initiator_and_responder_agree() {
        let mut alice = IdentityKeys::generate(0).unwrap();
        let mut bob = IdentityKeys::generate(2).unwrap();
        alice.generate_ephemeral().unwrap();

        let alice_bundle = alice.create_public_bundle();
        let bob_bundle = bob.create_public_bundle();

        let alice_sk = alice.x3dh_initiate(&bob_bundle).unwrap();
        let bob_sk = bob.x3dh_respond(&alice_bundle).unwrap();
        assert!(alice_sk.ct_eq(bob_sk.read()));
        // The one-time pre-key was consumed.
        assert_eq!(bob.one_time_prekey_count(), 1);
    }

    #[test]
    fn x3dh_agrees_without_one_time_prekeys() {
        let mut alice = IdentityKeys::generate(0).unwrap();
        let mut bob = IdentityKeys::generate(0).unwrap();
        alice.generate_ephemeral().unwrap();

        let alice_sk = alice.x3dh_initiate(&bob.create_public_bundle()).unwrap();
        let bob_sk = bob.x3dh_respond(&alice.create_public_bundle()).unwrap();
        assert!(alice_sk.ct_eq(bob_sk.read()));
    }

    #[test]
    fn rejects_spk_signed_by_wrong_identity() {
        let mut alice = IdentityKeys::generate(0).unwrap();
        let bob = IdentityKeys::generate(0).unwrap();
        let mallory = IdentityKeys::generate(0).unwrap();
        alice.generate_ephemeral().unwrap();

        let mut bundle = bob.create_public_bundle();
        bundle.signed_prekey_signature =
            mallory.sign(&bundle.signed_prekey_public).unwrap();
        match alice.x3dh_initiate(&bundle) {
            Err(ProtocolError::HandshakeRejected(_)) => {}
            other => panic!("expected HandshakeRejected, got {:?}", other.err()),
        }
    }

    #[test]
    fn rejects_zero_identity_key_in_bundle() {
        let mut alice = IdentityKeys::generate(0).unwrap();
        let bob = IdentityKeys::generate(0).unwrap();
        alice.generate_ephemeral().unwrap();

        let mut bundle = bob.create_public_bundle();
        bundle.identity_x25519 = [0u8; 32];
        assert!(alice.x3dh_initiate(&bundle).is_err());
    }

    #[test]
    fn responder_requires_initiator_ephemeral() {
        let alice = IdentityKeys::generate(0).unwrap();
        let mut bob = IdentityKeys::generate(0).unwrap();
        // Alice never generated an ephemeral; her bundle lacks one.
        match bob.x3dh_respond(&alice.create_public_bundle()) {
            Err(ProtocolError::HandshakeRejected(_)) => {}
            other => panic!("expected HandshakeRejected, got {:?}", other.err()),
        }
    }

    #[test]
    fn seeded_identities_are_deterministic() {
        let a = IdentityKeys::from_seed_material(&[1u8; 32], &[2u8; 32], &[3u8; 32], 7).unwrap();
        let b = IdentityKeys::from_seed_material(&[1u8; 32], &[2u8; 32], &[3u8; 32], 7).unwrap();
        assert_eq!(a.ed25519_public(), b.ed25519_public());
        assert_eq!(a.identity_x25519_public(), b.identity_x25519_public());
        assert_eq!(a.create_public_bundle(), b.create_public_bundle());
    }

    #[test]
    fn master_key_identities_are_deterministic() {
        let export = SecretBuffer::from_slice(b"an export key of sufficient len!").unwrap();
        let member = MembershipId::new([9u8; 16]);
        let profile = StretchProfile::new(8 * 1024, 1, 1);
        let a = IdentityKeys::from_export_key(&export, &member, 1, &profile, 0).unwrap();
        let b = IdentityKeys::from_export_key(&export, &member, 1, &profile, 0).unwrap();
        assert_eq!(a.ed25519_public(), b.ed25519_public());
        assert_eq!(a.identity_x25519_public(), b.identity_x25519_public());

        let other = IdentityKeys::from_export_key(
            &export,
            &MembershipId::new([8u8; 16]),
            1,
            &profile,
            0,
        )
        .unwrap();
        assert_ne!(a.ed25519_public(), other.ed25519_public());
    }

    #[test]
    fn fingerprint_is_grouped_hex() {
        let keys = IdentityKeys::generate(0).unwrap();
        let fp = keys.fingerprint();
        assert_eq!(fp.split(' ').count(), 10);
        assert!(fp.split(' ').all(|g| g.len() == 4));
    }
}
