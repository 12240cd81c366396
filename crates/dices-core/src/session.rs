//! Per-peer session state machine
//!
//! One [`SessionState`] exists per unordered peer pair, created lazily on
//! first send or receive and mutated on every encrypt, decrypt, and
//! ratchet. The implicit states:
//!
//! ```text
//! Absent ──initiate──▶ InitiatorPending ──first reply──▶ Established
//!    │                  (sending chain live,              (both chains
//!    └──first receive──▶ receiving uninitialized)          live)
//! ```
//!
//! Every transition is a single synchronous call: no partially-ratcheted
//! state is ever observable or persisted. All methods take the current
//! time and an RNG as parameters, keeping the state machine free of
//! system dependencies.

use dices_crypto::{
    CipherData, KemCiphertext, KeyId, Keys, KeyChain, NodeId, PreKeys, PreKeysPublic, RatchetId,
    RootChain, dh, derive_root_key, ratchet_id,
};
use dices_proto::{Envelope, EnvelopeFields};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    error::OverlayError,
    storage::{SESSION_INDEX, StorageError, indexed_key},
};

/// Sending-chain length that schedules an ML-KEM rekey
pub const DEFAULT_MESSAGE_BOUND: u64 = 100;

/// Elapsed time since the last ratchet that schedules an ML-KEM rekey
pub const DEFAULT_TIME_BOUND_MS: u64 = 60 * 60 * 1000; // 1 hour

/// Maximum age of a cached skipped key before pruning
pub const SKIPPED_KEY_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000; // 24 hours

/// Maximum distance a message number may run ahead of the receiving chain.
///
/// Enforced before any chain work, bounding both CPU and skipped-key
/// storage against adversarial message numbers.
pub const MAX_MESSAGE_SKIP: u64 = 1000;

/// A message key derived but not yet consumed, cached to service
/// out-of-order delivery.
#[derive(Clone, Serialize, Deserialize)]
pub struct SkippedKey {
    /// Position the key was derived for
    pub message_number: u64,
    /// The message key itself
    pub secret: [u8; 32],
    /// Unix milliseconds at derivation time (for pruning)
    pub created_at: u64,
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Persisted per-peer-pair ratchet record.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    ratchet_id: RatchetId,
    remote_key_id: Option<KeyId>,
    root_chain: RootChain,
    previous_chain_length: u64,
    skipped_keys: Vec<SkippedKey>,
    ratchet_at: u64,
}

impl SessionState {
    /// Storage key for the session with the given ratchet id.
    pub fn storage_key(ratchet_id: &RatchetId) -> Vec<u8> {
        indexed_key(SESSION_INDEX, ratchet_id.as_bytes())
    }

    /// This session's order-independent identifier.
    pub fn ratchet_id(&self) -> &RatchetId {
        &self.ratchet_id
    }

    /// The remote pre-key bundle id used for outbound envelopes, once
    /// known.
    pub fn remote_key_id(&self) -> Option<&KeyId> {
        self.remote_key_id.as_ref()
    }

    /// Record the remote pre-key bundle id (responder's first send).
    pub fn set_remote_key_id(&mut self, key_id: KeyId) {
        self.remote_key_id = Some(key_id);
    }

    /// The underlying root chain.
    pub fn root_chain(&self) -> &RootChain {
        &self.root_chain
    }

    /// Cached skipped keys awaiting late messages.
    pub fn skipped_keys(&self) -> &[SkippedKey] {
        &self.skipped_keys
    }

    /// Unix milliseconds of the last DH or KEM ratchet.
    pub fn ratchet_at(&self) -> u64 {
        self.ratchet_at
    }

    /// Initiate a session toward a peer discovered through its published
    /// pre-key bundle, producing the session-establishing envelope.
    ///
    /// Derives the first root key from a hybrid DH + ML-KEM exchange
    /// against the bundle, leaving the sending chain live and the
    /// receiving chain deliberately uninitialized: the initiator cannot
    /// decrypt anything until the peer's first reply triggers a DH
    /// ratchet. Eagerly deriving a receiving chain here would change the
    /// handshake's security properties.
    ///
    /// # Errors
    ///
    /// - `Crypto(InvalidKeyLength)` if the bundle's key lengths are wrong
    /// - `Protocol` if envelope signing fails
    pub fn initialize_as_initiator(
        local_node_id: &NodeId,
        remote_node_id: &NodeId,
        remote_keys: &PreKeysPublic,
        first_plaintext: &[u8],
        keys: &Keys,
        now_ms: u64,
        rng: &mut impl CryptoRngCore,
    ) -> Result<(Envelope, Self), OverlayError> {
        let remote_dh: [u8; 32] = remote_keys.dh_public_key.as_slice().try_into().map_err(
            |_| dices_crypto::CryptoError::InvalidKeyLength {
                field: "dhPublicKey",
                expected: 32,
                actual: remote_keys.dh_public_key.len(),
            },
        )?;

        let (kem_ciphertext, mut kem_shared) =
            dices_crypto::kem::encapsulate(&remote_keys.encryption_key, rng)?;

        let (dh_secret_key, _) = dh::generate_keypair(rng);
        let mut dh_shared = dh::shared_secret(&dh_secret_key, &remote_dh);

        let (root_key, sending_chain_key) =
            derive_root_key(&[0u8; 32], &dh_shared, Some(&kem_shared));
        dh_shared.zeroize();
        kem_shared.zeroize();

        let root_chain = RootChain::new(
            root_key,
            dh_secret_key,
            remote_dh,
            KeyChain::initialized(sending_chain_key),
            KeyChain::uninitialized(),
        );

        let mut state = Self {
            ratchet_id: ratchet_id(local_node_id, remote_node_id),
            remote_key_id: Some(remote_keys.key_id),
            root_chain,
            previous_chain_length: 0,
            skipped_keys: Vec::new(),
            ratchet_at: now_ms,
        };

        let envelope = state.encrypt_message(first_plaintext, keys, Some(kem_ciphertext), rng)?;
        Ok((envelope, state))
    }

    /// Accept a session-establishing envelope from an unknown peer.
    ///
    /// Decapsulates the envelope's KEM ciphertext with the local bundle,
    /// mirrors the initiator's first derivation to obtain the receiving
    /// chain, then immediately performs the sending-side half with a fresh
    /// ephemeral keypair. Both chains come out live; the remote key id
    /// stays unset until this side's first send fetches the peer's bundle.
    ///
    /// # Errors
    ///
    /// - `MissingKemCiphertext` if the envelope carries none
    pub fn initialize_as_responder(
        envelope: &Envelope,
        local_node_id: &NodeId,
        local_prekeys: &PreKeys,
        remote_node_id: &NodeId,
        now_ms: u64,
        rng: &mut impl CryptoRngCore,
    ) -> Result<Self, OverlayError> {
        let kem_ciphertext =
            envelope.kem_ciphertext().ok_or(OverlayError::MissingKemCiphertext)?;
        let mut kem_shared = local_prekeys.decapsulate(kem_ciphertext);

        let mut receiving_shared =
            local_prekeys.dh_shared_secret(envelope.dh_public_key());
        let (intermediate_root, receiving_chain_key) =
            derive_root_key(&[0u8; 32], &receiving_shared, Some(&kem_shared));
        receiving_shared.zeroize();
        kem_shared.zeroize();

        let (dh_secret_key, _) = dh::generate_keypair(rng);
        let mut sending_shared = dh::shared_secret(&dh_secret_key, envelope.dh_public_key());
        let (root_key, sending_chain_key) =
            derive_root_key(&intermediate_root, &sending_shared, None);
        sending_shared.zeroize();

        let root_chain = RootChain::new(
            root_key,
            dh_secret_key,
            *envelope.dh_public_key(),
            KeyChain::initialized(sending_chain_key),
            KeyChain::initialized(receiving_chain_key),
        );

        Ok(Self {
            ratchet_id: ratchet_id(local_node_id, remote_node_id),
            remote_key_id: None,
            root_chain,
            previous_chain_length: 0,
            skipped_keys: Vec::new(),
            ratchet_at: now_ms,
        })
    }

    /// Encrypt a message on the sending chain and advance it.
    ///
    /// The chain advances in memory before the caller persists this state;
    /// persistence is the commit point. If the subsequent persist fails the
    /// envelope must not be treated as sent, since re-encrypting after a
    /// reload would derive a different message key.
    ///
    /// # Errors
    ///
    /// - `UninitializedSendingChain` before initialization
    /// - `MissingRemoteKeyId` before the remote bundle id is known
    /// - `Protocol` if envelope signing fails
    pub fn encrypt_message(
        &mut self,
        plaintext: &[u8],
        keys: &Keys,
        kem_ciphertext: Option<Box<KemCiphertext>>,
        rng: &mut impl CryptoRngCore,
    ) -> Result<Envelope, OverlayError> {
        if !self.root_chain.sending_chain().is_initialized() {
            return Err(OverlayError::UninitializedSendingChain);
        }
        let key_id = self.remote_key_id.ok_or(OverlayError::MissingRemoteKeyId)?;

        let message_key = self.root_chain.sending_chain().secret()?;
        let cipher_data = CipherData::encrypt(message_key.key(), plaintext, rng);

        let envelope = Envelope::create(
            EnvelopeFields {
                key_id,
                dh_public_key: self.root_chain.dh_public_key(),
                message_number: self.root_chain.sending_chain().message_number(),
                previous_chain_length: self.previous_chain_length,
                kem_ciphertext,
                cipher_data,
            },
            keys,
        )?;

        self.root_chain.sending_chain_mut().next()?;

        Ok(envelope)
    }

    /// Decrypt an inbound envelope, ratcheting and caching skipped keys as
    /// needed.
    ///
    /// Order matters: skipped keys are consulted first (a late message
    /// must not trigger chain work), then a DH ratchet runs if the sender
    /// moved to a new DH key, then the skip bound is enforced before any
    /// keys are derived.
    ///
    /// # Errors
    ///
    /// - `UninitializedReceivingChain` for an initiator that has not yet
    ///   seen a reply
    /// - `MessageSkipTooLarge` when the skip bound is exceeded; state is
    ///   left unchanged by the guard itself
    /// - `Crypto(DecryptionFailed)` on AEAD failure
    pub fn decrypt_message(
        &mut self,
        envelope: &Envelope,
        now_ms: u64,
        rng: &mut impl CryptoRngCore,
    ) -> Result<Vec<u8>, OverlayError> {
        if let Some(plaintext) = self.try_skipped_key(envelope)? {
            return Ok(plaintext);
        }

        if envelope.dh_public_key() != self.root_chain.remote_dh_public_key() {
            self.perform_dh_ratchet(envelope.dh_public_key(), now_ms, rng)?;
        }

        if !self.root_chain.receiving_chain().is_initialized() {
            return Err(OverlayError::UninitializedReceivingChain);
        }

        let position = self.root_chain.receiving_chain().message_number();
        let skip = envelope.message_number().saturating_sub(position);
        if skip > MAX_MESSAGE_SKIP {
            return Err(OverlayError::MessageSkipTooLarge { skip, max: MAX_MESSAGE_SKIP });
        }

        while self.root_chain.receiving_chain().message_number() < envelope.message_number() {
            let secret = self.root_chain.receiving_chain().secret()?;
            self.skipped_keys.push(SkippedKey {
                message_number: self.root_chain.receiving_chain().message_number(),
                secret: secret.to_bytes(),
                created_at: now_ms,
            });
            self.root_chain.receiving_chain_mut().next()?;
        }

        let message_key = self.root_chain.receiving_chain().secret()?;
        let plaintext = envelope.cipher_data().decrypt(message_key.key())?;
        self.root_chain.receiving_chain_mut().next()?;

        Ok(plaintext)
    }

    /// Ratchet against a new remote DH key observed on an inbound
    /// envelope.
    ///
    /// # Errors
    ///
    /// - `Crypto(SameRemoteKey)` if the key has not actually changed
    pub fn perform_dh_ratchet(
        &mut self,
        remote_dh_public_key: &[u8; 32],
        now_ms: u64,
        rng: &mut impl CryptoRngCore,
    ) -> Result<(), OverlayError> {
        self.previous_chain_length = self.root_chain.sending_chain().message_number();
        self.root_chain.perform_dh_ratchet(remote_dh_public_key, rng)?;
        self.ratchet_at = now_ms;
        Ok(())
    }

    /// Hybrid rekey against a freshly fetched remote pre-key bundle.
    ///
    /// Returns the KEM ciphertext that must ride on the next outbound
    /// envelope. Also adopts the bundle's key id for subsequent sends.
    ///
    /// # Errors
    ///
    /// - `Crypto(InvalidKeyLength)` if the bundle's key lengths are wrong
    pub fn perform_ml_kem_ratchet(
        &mut self,
        remote_keys: &PreKeysPublic,
        now_ms: u64,
        rng: &mut impl CryptoRngCore,
    ) -> Result<Box<KemCiphertext>, OverlayError> {
        self.previous_chain_length = self.root_chain.sending_chain().message_number();
        let kem_ciphertext = self.root_chain.perform_ml_kem_ratchet(remote_keys, rng)?;
        self.remote_key_id = Some(remote_keys.key_id);
        self.ratchet_at = now_ms;
        Ok(kem_ciphertext)
    }

    /// Whether an ML-KEM rekey should precede the next send.
    ///
    /// Advisory policy only; the orchestration layer consults it before
    /// each send and fetches a fresh remote bundle when it fires.
    pub fn should_ratchet(&self, message_bound: u64, time_bound_ms: u64, now_ms: u64) -> bool {
        if self.root_chain.sending_chain().message_number() >= message_bound {
            return true;
        }
        now_ms.saturating_sub(self.ratchet_at) >= time_bound_ms
    }

    /// Drop cached skipped keys older than `max_age_ms`.
    ///
    /// Returns the number of keys removed. Bounds growth from keys never
    /// claimed by a late message.
    pub fn prune_skipped_keys(&mut self, max_age_ms: u64, now_ms: u64) -> usize {
        let before = self.skipped_keys.len();
        self.skipped_keys
            .retain(|skipped| now_ms.saturating_sub(skipped.created_at) <= max_age_ms);
        before - self.skipped_keys.len()
    }

    /// Try to decrypt with a cached skipped key; consumes the entry on a
    /// match.
    fn try_skipped_key(&mut self, envelope: &Envelope) -> Result<Option<Vec<u8>>, OverlayError> {
        let Some(index) = self
            .skipped_keys
            .iter()
            .position(|skipped| skipped.message_number == envelope.message_number())
        else {
            return Ok(None);
        };

        let skipped = self.skipped_keys.remove(index);
        let plaintext = envelope.cipher_data().decrypt(&skipped.secret)?;
        Ok(Some(plaintext))
    }

    /// Serialize for storage.
    ///
    /// # Errors
    ///
    /// - `Serialization` if CBOR encoding fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        Ok(buf)
    }

    /// Rehydrate a session from storage.
    ///
    /// # Errors
    ///
    /// - `Serialization` if CBOR decoding fails
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        ciborium::de::from_reader(bytes)
            .map_err(|err| StorageError::Serialization(err.to_string()))
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("ratchet_id", &self.ratchet_id)
            .field("remote_key_id", &self.remote_key_id)
            .field("previous_chain_length", &self.previous_chain_length)
            .field("skipped_keys", &self.skipped_keys.len())
            .field("ratchet_at", &self.ratchet_at)
            .finish_non_exhaustive()
    }
}
