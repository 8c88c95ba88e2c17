//! Trusted-process authentication core for the Sidecar desktop companion.
//!
//! Runs the OAuth2 Device Authorization Grant against the identity provider,
//! keeps one session alive across app restarts with proactive, rate-limited
//! token refresh, and persists session material under OS-backed encryption
//! with a software-encrypted fallback.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sidecar_auth::prelude::*;
//! use sidecar_auth::storage::{default_storage_dir, NoOsEncryption};
//!
//! # async fn example() -> sidecar_auth::error::Result<()> {
//! let config = AuthConfig::from_env()?;
//! let auth = AuthService::new(config, default_storage_dir(), Arc::new(NoOsEncryption));
//! if auth.initialize().is_none() {
//!     let pairing = auth.start_device_flow().await?;
//!     println!("Visit {} and enter {}", pairing.verification_uri, pairing.user_code);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod limit;
pub mod manager;
pub mod prelude;
pub mod provider;
pub mod service;
pub mod session;
pub mod storage;
