//! Overlay orchestration: session lookup, discovery, and persistence
//!
//! Ties the pieces together for callers: look up or create the session for
//! a peer, fetch pre-keys through discovery when needed, run the ratchet,
//! and persist the result. All ratchet math stays synchronous; the only
//! await points are storage I/O and DHT lookups.
//!
//! # Concurrency
//!
//! At most one encrypt-or-decrypt operation runs per `ratchetId` at a
//! time, enforced by a per-session async mutex. The load→mutate→persist
//! cycle is not atomic, and two concurrent operations against one session
//! would silently lose a chain advancement - a desynchronization the
//! protocol cannot recover from.

use std::{collections::HashMap, sync::Arc, time::Duration};

use dices_crypto::{Keys, NodeId, PreKeys, PreKeysPublic, RatchetId, ratchet_id};
use dices_proto::{Envelope, is_supported_buffer};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    discovery::{Discovery, DiscoveryError, SignedPreKeys},
    environment::Environment,
    error::OverlayError,
    prekeys::PreKeyRecord,
    session::{DEFAULT_MESSAGE_BOUND, DEFAULT_TIME_BOUND_MS, SKIPPED_KEY_MAX_AGE_MS, SessionState},
    storage::{PREKEYS_INDEX, SESSION_INDEX, Storage},
};

/// Tunable bounds for ratchet policy and maintenance.
#[derive(Debug, Clone)]
pub struct OverlayOptions {
    /// Sending-chain length that schedules an ML-KEM rekey
    pub message_bound: u64,
    /// Elapsed time since the last ratchet that schedules an ML-KEM rekey
    pub time_bound_ms: u64,
    /// Maximum age of a cached skipped key
    pub skipped_key_max_age_ms: u64,
    /// How long a rotated pre-key bundle stays loadable before pruning
    pub ratchet_key_ttl_ms: u64,
    /// Upper bound on a single DHT lookup
    pub lookup_timeout: Duration,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            message_bound: DEFAULT_MESSAGE_BOUND,
            time_bound_ms: DEFAULT_TIME_BOUND_MS,
            skipped_key_max_age_ms: SKIPPED_KEY_MAX_AGE_MS,
            ratchet_key_ttl_ms: 60 * 60 * 1000,
            lookup_timeout: Duration::from_secs(30),
        }
    }
}

/// The overlay endpoint: local identity plus injected storage, discovery,
/// and environment.
pub struct Overlay<S, D, E> {
    keys: Keys,
    storage: S,
    discovery: D,
    env: E,
    options: OverlayOptions,
    current_prekeys: Mutex<Option<PreKeyRecord>>,
    session_locks: Mutex<HashMap<RatchetId, Arc<Mutex<()>>>>,
}

impl<S: Storage, D: Discovery, E: Environment> Overlay<S, D, E> {
    /// Assemble an overlay endpoint.
    pub fn new(keys: Keys, storage: S, discovery: D, env: E, options: OverlayOptions) -> Self {
        Self {
            keys,
            storage,
            discovery,
            env,
            options,
            current_prekeys: Mutex::new(None),
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Local identity keys.
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Local node id.
    pub fn node_id(&self) -> NodeId {
        self.keys.node_id()
    }

    /// Configured bounds.
    pub fn options(&self) -> &OverlayOptions {
        &self.options
    }

    /// Load or create the local pre-key bundle.
    ///
    /// Scans stored bundles and adopts the first non-rotated one; when all
    /// bundles are rotated (or none exist) a fresh bundle is generated and
    /// persisted. Returns the current bundle's public projection, ready
    /// for publication.
    ///
    /// # Errors
    ///
    /// - `Storage` on persistence failure
    pub async fn load_prekeys(&self) -> Result<PreKeysPublic, OverlayError> {
        let mut current = self.current_prekeys.lock().await;
        if let Some(record) = current.as_ref() {
            return Ok(record.public());
        }

        for (_, value) in self.storage.iterate(&[PREKEYS_INDEX]).await? {
            let record = PreKeyRecord::from_bytes(&value)?;
            if !record.is_rotated() {
                debug!(key_id = ?record.keys.key_id(), "loaded existing pre-key bundle");
                let public = record.public();
                *current = Some(record);
                return Ok(public);
            }
        }

        debug!("generating new pre-key bundle");
        let record = PreKeyRecord::new(PreKeys::generate(&mut self.env.rng()));
        self.storage
            .put(&PreKeyRecord::storage_key(&record.keys.key_id()), record.to_bytes()?)
            .await?;

        let public = record.public();
        *current = Some(record);
        Ok(public)
    }

    /// Rotate the local pre-key bundle.
    ///
    /// The old bundle is stamped `rotated_at` and kept loadable (late
    /// messages may still name its key id) until the TTL sweep removes it.
    /// Returns the new bundle signed for DHT publication; actually
    /// publishing it is the caller's job.
    ///
    /// # Errors
    ///
    /// - `Storage` on persistence failure
    /// - `Crypto` if signing the published value fails
    pub async fn rotate_keys(&self) -> Result<SignedPreKeys, OverlayError> {
        let now_ms = self.env.now_ms();
        let mut current = self.current_prekeys.lock().await;

        if let Some(old) = current.as_mut() {
            old.rotated_at = Some(now_ms);
            self.storage
                .put(&PreKeyRecord::storage_key(&old.keys.key_id()), old.to_bytes()?)
                .await?;
        }

        let record = PreKeyRecord::new(PreKeys::generate(&mut self.env.rng()));
        self.storage
            .put(&PreKeyRecord::storage_key(&record.keys.key_id()), record.to_bytes()?)
            .await?;

        info!(key_id = ?record.keys.key_id(), "rotated pre-key bundle");

        let value = SignedPreKeys::create(record.public(), now_ms, &self.keys)?;
        *current = Some(record);
        Ok(value)
    }

    /// Maintenance sweep: drop expired rotated bundles and stale skipped
    /// keys.
    ///
    /// # Errors
    ///
    /// - `Storage` on persistence failure
    pub async fn prune(&self) -> Result<(), OverlayError> {
        let now_ms = self.env.now_ms();

        let mut pruned_bundles = 0usize;
        for (key, value) in self.storage.iterate(&[PREKEYS_INDEX]).await? {
            let record = PreKeyRecord::from_bytes(&value)?;
            if let Some(rotated_at) = record.rotated_at
                && now_ms.saturating_sub(rotated_at) > self.options.ratchet_key_ttl_ms
            {
                self.storage.del(&key).await?;
                pruned_bundles += 1;
            }
        }

        let mut pruned_keys = 0usize;
        for (key, value) in self.storage.iterate(&[SESSION_INDEX]).await? {
            let mut state = SessionState::from_bytes(&value)?;
            let removed =
                state.prune_skipped_keys(self.options.skipped_key_max_age_ms, now_ms);
            if removed > 0 {
                self.storage.put(&key, state.to_bytes()?).await?;
                pruned_keys += removed;
            }
        }

        debug!(pruned_bundles, pruned_keys, "pruned overlay state");
        Ok(())
    }

    /// Fetch a peer's published initiation keys through discovery.
    ///
    /// Verifies that the identity recovered from the value's signature is
    /// the node the value was looked up under before trusting it.
    ///
    /// # Errors
    ///
    /// - `InitiationKeysNotFound` when the DHT has no value for the peer
    /// - `Discovery(Timeout)` when the lookup exceeds the configured bound
    /// - `SenderMismatch` when the value was signed by someone else
    pub async fn get_initiation_keys(
        &self,
        node_id: &NodeId,
    ) -> Result<PreKeysPublic, OverlayError> {
        let value = tokio::time::timeout(
            self.options.lookup_timeout,
            self.discovery.find_value(node_id),
        )
        .await
        .map_err(|_| DiscoveryError::Timeout {
            elapsed_ms: self.options.lookup_timeout.as_millis() as u64,
        })??
        .ok_or(OverlayError::InitiationKeysNotFound { node_id: *node_id })?;

        let recovered = value.recover_node_id()?;
        if recovered != *node_id {
            warn!(%recovered, expected = %node_id, "discovery value signed by wrong identity");
            return Err(OverlayError::SenderMismatch { expected: *node_id, recovered });
        }

        Ok(value.initiation_keys)
    }

    /// Encrypt `data` for a peer, producing a signed envelope.
    ///
    /// Initializes the session on first contact (fetching the peer's
    /// bundle through discovery), adopts the peer's bundle id on a
    /// responder's first send, and performs a hybrid rekey when the
    /// message or time bound has been reached.
    ///
    /// # Errors
    ///
    /// - `Resource`-kind errors when discovery or storage fail; on a
    ///   storage failure the envelope must be discarded and the message
    ///   re-encrypted
    pub async fn wrap(&self, remote_node_id: &NodeId, data: &[u8]) -> Result<Envelope, OverlayError> {
        let local_node_id = self.node_id();
        let ratchet_id = ratchet_id(&local_node_id, remote_node_id);
        let _guard = self.session_guard(ratchet_id).await;

        let now_ms = self.env.now_ms();
        let mut rng = self.env.rng();

        let Some(mut state) = self.load_session(&ratchet_id).await? else {
            let remote_keys = self.get_initiation_keys(remote_node_id).await?;
            let (envelope, state) = SessionState::initialize_as_initiator(
                &local_node_id,
                remote_node_id,
                &remote_keys,
                data,
                &self.keys,
                now_ms,
                &mut rng,
            )?;

            debug!(?ratchet_id, remote = %remote_node_id, "initialized session as initiator");
            self.persist_session(&state).await?;
            return Ok(envelope);
        };

        let mut kem_ciphertext = None;

        if state.remote_key_id().is_none() {
            let remote_keys = self.get_initiation_keys(remote_node_id).await?;
            state.set_remote_key_id(remote_keys.key_id);
        }

        if state.should_ratchet(self.options.message_bound, self.options.time_bound_ms, now_ms) {
            let remote_keys = self.get_initiation_keys(remote_node_id).await?;
            kem_ciphertext = Some(state.perform_ml_kem_ratchet(&remote_keys, now_ms, &mut rng)?);
            debug!(?ratchet_id, "performed scheduled ML-KEM rekey");
        }

        let envelope = state.encrypt_message(data, &self.keys, kem_ciphertext, &mut rng)?;
        self.persist_session(&state).await?;

        Ok(envelope)
    }

    /// Authenticate and decrypt an inbound envelope.
    ///
    /// The sender's identity is recovered from the signature; when
    /// `expected_remote` is given (e.g. the transport knows who it is
    /// talking to) a mismatch fails before any session work. First
    /// messages from unknown peers initialize responder state.
    ///
    /// # Errors
    ///
    /// - `SenderMismatch` when the recovered identity is not the expected
    ///   peer
    /// - `UnknownKeyId` when no local bundle matches the envelope
    /// - `MissingKemCiphertext` when an unknown peer's first message lacks
    ///   one
    pub async fn unwrap(
        &self,
        envelope: &Envelope,
        expected_remote: Option<&NodeId>,
    ) -> Result<Vec<u8>, OverlayError> {
        let remote_node_id = envelope.recover_node_id()?;
        if let Some(expected) = expected_remote
            && *expected != remote_node_id
        {
            return Err(OverlayError::SenderMismatch {
                expected: *expected,
                recovered: remote_node_id,
            });
        }

        let record = self
            .load_prekey_record(envelope.key_id())
            .await?
            .ok_or_else(|| OverlayError::UnknownKeyId { key_id: *envelope.key_id() })?;

        let local_node_id = self.node_id();
        let ratchet_id = ratchet_id(&local_node_id, &remote_node_id);
        let _guard = self.session_guard(ratchet_id).await;

        let now_ms = self.env.now_ms();
        let mut rng = self.env.rng();

        let mut state = match self.load_session(&ratchet_id).await? {
            Some(state) => state,
            None => {
                debug!(?ratchet_id, remote = %remote_node_id, "initialized session as responder");
                SessionState::initialize_as_responder(
                    envelope,
                    &local_node_id,
                    &record.keys,
                    &remote_node_id,
                    now_ms,
                    &mut rng,
                )?
            },
        };

        let plaintext = state.decrypt_message(envelope, now_ms, &mut rng)?;
        self.persist_session(&state).await?;

        Ok(plaintext)
    }

    /// Encrypt `data` for a peer and encode the envelope for the wire.
    ///
    /// # Errors
    ///
    /// As for [`wrap`](Self::wrap).
    pub async fn encrypt(
        &self,
        remote_node_id: &NodeId,
        data: &[u8],
    ) -> Result<Vec<u8>, OverlayError> {
        Ok(self.wrap(remote_node_id, data).await?.encode_to_vec())
    }

    /// Decode and decrypt a wire buffer.
    ///
    /// # Errors
    ///
    /// As for [`unwrap`](Self::unwrap), plus `Protocol` on malformed
    /// buffers.
    pub async fn decrypt(&self, buffer: &[u8]) -> Result<Vec<u8>, OverlayError> {
        let envelope = Envelope::decode(buffer)?;
        self.unwrap(&envelope, None).await
    }

    /// Transport-boundary entry point with silent drop semantics.
    ///
    /// Buffers that do not carry our magic bytes or a supported version
    /// return `Ok(None)` without error: answering protocol-confusion
    /// probes would amplify adversarial traffic into application-visible
    /// failures.
    ///
    /// # Errors
    ///
    /// As for [`decrypt`](Self::decrypt), for buffers that pass the
    /// preflight check.
    pub async fn handle_buffer(&self, buffer: &[u8]) -> Result<Option<Vec<u8>>, OverlayError> {
        if !is_supported_buffer(buffer) {
            debug!(len = buffer.len(), "dropping buffer without supported magic/version");
            return Ok(None);
        }
        self.decrypt(buffer).await.map(Some)
    }

    /// Acquire this session's operation lock.
    async fn session_guard(&self, ratchet_id: RatchetId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.session_locks.lock().await;
            Arc::clone(locks.entry(ratchet_id).or_default())
        };
        lock.lock_owned().await
    }

    async fn load_session(
        &self,
        ratchet_id: &RatchetId,
    ) -> Result<Option<SessionState>, OverlayError> {
        match self.storage.get(&SessionState::storage_key(ratchet_id)).await? {
            Some(bytes) => Ok(Some(SessionState::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn persist_session(&self, state: &SessionState) -> Result<(), OverlayError> {
        self.storage
            .put(&SessionState::storage_key(state.ratchet_id()), state.to_bytes()?)
            .await?;
        Ok(())
    }

    async fn load_prekey_record(
        &self,
        key_id: &dices_crypto::KeyId,
    ) -> Result<Option<PreKeyRecord>, OverlayError> {
        match self.storage.get(&PreKeyRecord::storage_key(key_id)).await? {
            Some(bytes) => Ok(Some(PreKeyRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<S, D, E> std::fmt::Debug for Overlay<S, D, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay").field("node_id", &self.keys.node_id()).finish_non_exhaustive()
    }
}
