//! Pluggable authentication for broker listeners.
//!
//! Providers are registered by name in a [`ProviderRegistry`] during
//! bootstrap. Listeners never talk to a provider directly: they hold an
//! [`AuthManager`] resolved from one or more provider names.

mod registry;
mod store;

pub use registry::{AuthManager, ProviderRegistry};
pub use store::CredentialStore;

use thiserror::Error;

/// Name the built-in credential provider is registered under.
pub const INTERNAL_PROVIDER: &str = "internal";

/// Outcome of a credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Allow,
    Deny,
}

impl AuthStatus {
    pub fn is_allowed(self) -> bool {
        matches!(self, AuthStatus::Allow)
    }
}

/// Trait implemented by credential-checking plugins.
pub trait AuthProvider: Send + Sync {
    fn check(&self, username: &str, secret: &str) -> AuthStatus;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("auth provider `{0}` is already registered")]
    DuplicateProvider(String),
    #[error("auth provider `{0}` is not registered")]
    UnknownProvider(String),
    #[error("no auth providers requested")]
    NoProviders,
}
