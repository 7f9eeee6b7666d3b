#![doc = include_str!("../README.md")]

pub mod api;
#[cfg(feature = "http")]
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod navigator;
pub mod storage;
pub mod types;

// Re-exports for convenient access
pub use api::SessionApi;
#[cfg(feature = "http")]
pub use client::HttpApiClient;
#[cfg(feature = "http")]
pub use config::ClientConfig;
pub use config::StorageKeys;
pub use controller::{
    ADMIN_ONLY_MESSAGE, LogoutOptions, PageGuard, SESSION_EXPIRED_MESSAGE, SessionController,
    Subscription,
};
pub use error::Error;
pub use navigator::{LoggingNavigator, Navigator};
pub use storage::{FileStore, KeyValueStore, MemoryStore, migrate_keys};
pub use types::{
    ADMIN_ONLY, ApiKey, ApiKeyRecord, PageAccess, RegisterRequest, SessionEnvelope, SessionUser,
    Token, preferred_api_key,
};
