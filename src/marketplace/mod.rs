//! Marketplace integration: OAuth token endpoint, claims API, payload normalization.

mod client;
pub mod error;
pub mod normalize;
mod retry;
mod traits;

#[cfg(test)]
pub mod fake;

pub use client::MarketplaceClient;
pub use error::{ApiRetryClass, MarketplaceError};
pub use normalize::{NormalizedClaim, RawClaim, ResourceKind, ResourceRef};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use traits::{ClaimSearch, ClaimsApi, ClaimsPage, OAuthClient, TokenSet};
