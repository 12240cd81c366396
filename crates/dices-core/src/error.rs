//! Error types for the DICES overlay core.
//!
//! Strongly-typed errors for the session state machine and orchestration.
//! Layer errors (`CryptoError`, `ProtocolError`, `StorageError`,
//! `DiscoveryError`) are wrapped with their cause preserved; every error
//! additionally classifies itself into one of the five protocol error
//! kinds via [`OverlayError::kind`].

use dices_crypto::{CryptoError, KeyId, NodeId};
use dices_proto::ProtocolError;
use thiserror::Error;

use crate::{discovery::DiscoveryError, storage::StorageError};

/// Broad classification of an overlay error.
///
/// Mirrors the protocol's error taxonomy; useful for metrics and for
/// deciding whether an error is attributable to the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed envelope, wrong key lengths, unsupported version
    Validation,
    /// Recovered sender identity does not match expectations, or the
    /// ciphertext failed authentication
    Authentication,
    /// Operation attempted against a session in the wrong state
    State,
    /// Missing pre-keys, session records, or DHT lookup failures
    Resource,
    /// Bounded-resource guard tripped by adversarial input
    DosGuard,
}

/// Errors from session and orchestration operations
#[derive(Error, Debug)]
pub enum OverlayError {
    /// Envelope could not be parsed or constructed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Persistence failed
    ///
    /// On the encrypt path this propagates even though the in-memory chain
    /// has already advanced; the caller must NOT treat the produced
    /// envelope as sent, and must re-encrypt rather than retry the send.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// DHT lookup failed
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Recovered sender identity does not match the expected peer
    #[error("sender mismatch: recovered {recovered}, expected {expected}")]
    SenderMismatch {
        /// The peer we expected to hear from
        expected: NodeId,
        /// The identity recovered from the signature
        recovered: NodeId,
    },

    /// First message from a peer must carry a KEM ciphertext
    #[error("cannot initialize session: first message is missing the KEM ciphertext")]
    MissingKemCiphertext,

    /// Cannot encrypt before learning the remote pre-key bundle id
    #[error("remote key id not set in session state")]
    MissingRemoteKeyId,

    /// Cannot encrypt with an uninitialized sending chain
    #[error("sending chain not initialized")]
    UninitializedSendingChain,

    /// Cannot decrypt before the first inbound DH ratchet
    #[error("receiving chain not initialized")]
    UninitializedReceivingChain,

    /// Message number too far ahead of the receiving chain
    #[error("message skip too large: {skip} > {max}")]
    MessageSkipTooLarge {
        /// Requested skip distance
        skip: u64,
        /// Configured bound
        max: u64,
    },

    /// No local pre-key bundle stored under the envelope's key id
    #[error("no local pre-keys found for key id {key_id:02x?}")]
    UnknownKeyId {
        /// Key id named by the inbound envelope
        key_id: KeyId,
    },

    /// Peer has not published initiation keys to the DHT
    #[error("no initiation keys published for node {node_id}")]
    InitiationKeysNotFound {
        /// The peer that was looked up
        node_id: NodeId,
    },
}

impl OverlayError {
    /// Classify this error into the protocol taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) | Self::MissingKemCiphertext => ErrorKind::Validation,
            Self::Crypto(err) => match err {
                CryptoError::UninitializedChain | CryptoError::SameRemoteKey => ErrorKind::State,
                CryptoError::DecryptionFailed { .. } => ErrorKind::Authentication,
                CryptoError::InvalidKeyLength { .. }
                | CryptoError::Signature { .. }
                | CryptoError::InvalidSecretKey => ErrorKind::Validation,
            },
            Self::SenderMismatch { .. } => ErrorKind::Authentication,
            Self::MissingRemoteKeyId
            | Self::UninitializedSendingChain
            | Self::UninitializedReceivingChain => ErrorKind::State,
            Self::MessageSkipTooLarge { .. } => ErrorKind::DosGuard,
            Self::Storage(_)
            | Self::Discovery(_)
            | Self::UnknownKeyId { .. }
            | Self::InitiationKeysNotFound { .. } => ErrorKind::Resource,
        }
    }
}
