//! Authorization cache (C5).

pub mod cache;

pub use cache::{
    AuthorizationCache, AuthorizationCacheConfig, RestAuthorizationCache, DEFAULT_FRESHNESS,
    DEFAULT_NEGATIVE_TTL,
};
