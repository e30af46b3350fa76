//! Identity query: the validated (email?, phone?) fragment of a request.

use crate::error::{Error, Result};

/// An incoming identity fragment with at least one field present.
/// Only [`IdentityQuery::new`] builds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityQuery {
    email: Option<String>,
    phone_number: Option<String>,
}

impl IdentityQuery {
    /// Validate a raw fragment. Empty strings count as absent.
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Result<Self> {
        let email = email.filter(|e| !e.is_empty());
        let phone_number = phone_number.filter(|p| !p.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(Error::InvalidRequest(
                "email or phoneNumber is required".into(),
            ));
        }
        Ok(Self {
            email,
            phone_number,
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// Mutual-exclusion keys for this fragment, sorted and deduplicated.
    ///
    /// Keys are coarser than matching (emails are case-folded) so two
    /// requests that could touch the same identity always contend.
    pub fn lock_keys(&self) -> Vec<LockKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(email) = &self.email {
            keys.push(LockKey::email(email));
        }
        if let Some(phone) = &self.phone_number {
            keys.push(LockKey::phone(phone));
        }
        keys.sort();
        keys.dedup();
        keys
    }
}

/// A normalized identity fragment used to serialize concurrent resolutions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn email(email: &str) -> Self {
        Self(format!("email:{}", email.trim().to_lowercase()))
    }

    pub fn phone(phone: &str) -> Self {
        Self(format!("phone:{}", phone.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
