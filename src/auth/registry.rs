use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use super::{AuthError, AuthProvider, AuthStatus};

/// Named set of auth providers, built once per bootstrap run.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AuthProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `name`. An existing registration is never
    /// replaced.
    pub fn register<P>(&mut self, name: impl Into<String>, provider: P) -> Result<(), AuthError>
    where
        P: AuthProvider + 'static,
    {
        self.register_shared(name, Arc::new(provider))
    }

    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn AuthProvider>,
    ) -> Result<(), AuthError> {
        let name = name.into();
        if self.providers.contains_key(&name) {
            return Err(AuthError::DuplicateProvider(name));
        }
        info!(provider = %name, "registered auth provider");
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolve an [`AuthManager`] over `names`, in the order given.
    pub fn resolve_manager<I, S>(&self, names: I) -> Result<AuthManager, AuthError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut resolved: Vec<(String, Arc<dyn AuthProvider>)> = Vec::new();
        for name in names {
            let name = name.as_ref();
            if resolved.iter().any(|(n, _)| n == name) {
                continue;
            }
            let provider = self
                .providers
                .get(name)
                .ok_or_else(|| AuthError::UnknownProvider(name.to_string()))?;
            resolved.push((name.to_string(), Arc::clone(provider)));
        }

        if resolved.is_empty() {
            return Err(AuthError::NoProviders);
        }

        Ok(AuthManager {
            providers: resolved,
        })
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .finish()
    }
}

/// Handle listeners use to authenticate connections.
///
/// A connection is allowed as soon as any of the resolved providers allows
/// it; providers are consulted in resolution order.
#[derive(Clone)]
pub struct AuthManager {
    providers: Vec<(String, Arc<dyn AuthProvider>)>,
}

impl AuthManager {
    pub fn check(&self, username: &str, secret: &str) -> AuthStatus {
        for (name, provider) in &self.providers {
            if provider.check(username, secret).is_allowed() {
                debug!(provider = %name, username, "credentials accepted");
                return AuthStatus::Allow;
            }
        }
        debug!(username, "credentials rejected");
        AuthStatus::Deny
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthManager")
            .field("providers", &self.providers().collect::<Vec<_>>())
            .finish()
    }
}
