//! Convenience re-exports for common use.

pub use crate::config::AuthConfig;
pub use crate::device::DeviceAuthorization;
pub use crate::error::{AuthError, Result};
pub use crate::events::{AuthEvent, AuthEventBus, AuthSubscription};
pub use crate::service::AuthService;
pub use crate::session::{Session, Tokens, User};
pub use crate::storage::{OsEncryption, SecureStorage};
