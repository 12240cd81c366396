//! Triple ratchet state: per-direction key chains and the root chain.

mod chain;
mod derivation;
mod root;

pub use chain::{KeyChain, MessageKey};
pub use derivation::derive_root_key;
pub use root::RootChain;
