//! Contact: one row of identity data.
//!
//! Contacts form clusters: one primary plus every secondary whose
//! `linked_id` names that primary. Linkage is exactly one level deep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned contact identifier. Monotonic by creation, never reused.
pub type ContactId = i64;

/// Whether a contact is the canonical representative of its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkPrecedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(format!("unknown link precedence: '{other}'")),
        }
    }
}

/// A persisted contact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,

    /// Present iff `link_precedence` is `Secondary`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_id: Option<ContactId>,

    pub link_precedence: LinkPrecedence,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// The id of the primary that owns this contact's cluster.
    ///
    /// A secondary with no `linked_id` is corrupt; it is treated as its own
    /// primary so callers surface the problem when the cluster is loaded.
    pub fn primary_id(&self) -> ContactId {
        match self.link_precedence {
            LinkPrecedence::Primary => self.id,
            LinkPrecedence::Secondary => self.linked_id.unwrap_or(self.id),
        }
    }

    /// Ordering key used for primary selection: oldest `created_at`,
    /// ties broken by id.
    pub fn age_key(&self) -> (DateTime<Utc>, ContactId) {
        (self.created_at, self.id)
    }
}

/// Sort contacts oldest first, the order every store read returns.
pub fn sort_by_age(contacts: &mut [Contact]) {
    contacts.sort_by_key(Contact::age_key);
}

/// A contact to be inserted. Construct through [`NewContact::primary`] or
/// [`NewContact::secondary`] so `linked_id` is present iff secondary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    email: Option<String>,
    phone_number: Option<String>,
    linked_id: Option<ContactId>,
}

impl NewContact {
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            linked_id: None,
        }
    }

    pub fn secondary(
        email: Option<String>,
        phone_number: Option<String>,
        primary_id: ContactId,
    ) -> Self {
        Self {
            email,
            phone_number,
            linked_id: Some(primary_id),
        }
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    pub fn linked_id(&self) -> Option<ContactId> {
        self.linked_id
    }

    pub fn precedence(&self) -> LinkPrecedence {
        if self.linked_id.is_some() {
            LinkPrecedence::Secondary
        } else {
            LinkPrecedence::Primary
        }
    }

    /// At least one identity fragment must be present.
    pub fn has_fragment(&self) -> bool {
        self.email.is_some() || self.phone_number.is_some()
    }
}
