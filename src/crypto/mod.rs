//! Token-at-rest encryption and OAuth state signing.

mod engine;

pub use engine::{CryptoEngine, CryptoError, OAuthState};
