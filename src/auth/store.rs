use std::collections::HashMap;

use super::{AuthProvider, AuthStatus};
use crate::config::CredentialEntry;

/// In-memory username to secret map backing the `internal` provider.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    creds: HashMap<String, String>,
}

impl CredentialStore {
    /// Build a store from configuration entries. A username that appears
    /// more than once keeps the secret of its last occurrence.
    pub fn load<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a CredentialEntry>,
    {
        Self::from_pairs(
            entries
                .into_iter()
                .map(|e| (e.user.clone(), e.password.clone())),
        )
    }

    pub fn from_pairs<I, U, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, S)>,
        U: Into<String>,
        S: Into<String>,
    {
        let mut creds = HashMap::new();
        for (user, secret) in pairs {
            creds.insert(user.into(), secret.into());
        }
        Self { creds }
    }

    pub fn len(&self) -> usize {
        self.creds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creds.is_empty()
    }

    pub fn secret_of(&self, username: &str) -> Option<&str> {
        self.creds.get(username).map(String::as_str)
    }
}

impl AuthProvider for CredentialStore {
    fn check(&self, username: &str, secret: &str) -> AuthStatus {
        match self.creds.get(username) {
            Some(stored) if stored == secret => AuthStatus::Allow,
            _ => AuthStatus::Deny,
        }
    }
}
