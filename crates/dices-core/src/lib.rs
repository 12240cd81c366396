//! DICES Overlay Core
//!
//! Per-peer session state machine and orchestration for the DICES bounded
//! triple ratchet: pairwise, forward-secret, post-quantum-hybrid encrypted
//! messaging between peers identified by public-key-derived node ids.
//!
//! The external world is reached through two injected traits: [`Storage`]
//! (key-value persistence for pre-key bundles and session state) and
//! [`Discovery`] (DHT lookup of peers' published pre-keys). Everything
//! else - ratchet math, envelope signing, skipped-key recovery - is
//! synchronous and deterministic given an [`Environment`].
//!
//! # Typical flow
//!
//! ```text
//! caller ──▶ Overlay::encrypt ──▶ load/create SessionState
//!                                  (DHT pre-key fetch on first contact
//!                                   or scheduled rekey)
//!                             ──▶ chain key → AEAD → signed Envelope
//!                             ──▶ persist session (commit point)
//! ```
//!
//! Decryption runs the mirror image, with skipped-key recovery for
//! out-of-order delivery and a bounded skip guard against adversarial
//! message numbers.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod discovery;
pub mod environment;
pub mod error;
pub mod overlay;
pub mod prekeys;
pub mod session;
pub mod storage;

pub use discovery::{Discovery, DiscoveryError, SignedPreKeys};
pub use environment::{Environment, SystemEnvironment};
pub use error::{ErrorKind, OverlayError};
pub use overlay::{Overlay, OverlayOptions};
pub use prekeys::PreKeyRecord;
pub use session::{
    DEFAULT_MESSAGE_BOUND, DEFAULT_TIME_BOUND_MS, MAX_MESSAGE_SKIP, SKIPPED_KEY_MAX_AGE_MS,
    SessionState, SkippedKey,
};
pub use storage::{MemoryStorage, Storage, StorageError};
