//! View builder: projects a resolved cluster into its canonical response.

use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId};
use crate::error::{Error, Result};

/// The consolidated view of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Build the view of `cluster`.
///
/// The primary's values come first, then each secondary's in ascending
/// `created_at` order. Every email and phone appears once, in first-seen
/// order. Fails with `InvariantViolation` unless the cluster holds exactly
/// one primary.
pub fn build_view(cluster: &[Contact]) -> Result<IdentityView> {
    let mut primaries = cluster.iter().filter(|c| c.is_primary());
    let primary = primaries.next().ok_or_else(|| {
        Error::InvariantViolation(format!(
            "cluster of {} contact(s) has no primary",
            cluster.len()
        ))
    })?;
    if let Some(other) = primaries.next() {
        return Err(Error::InvariantViolation(format!(
            "cluster has more than one primary ({} and {})",
            primary.id, other.id
        )));
    }

    let mut secondaries: Vec<&Contact> = cluster.iter().filter(|c| !c.is_primary()).collect();
    secondaries.sort_by_key(|c| c.age_key());

    let mut view = IdentityView {
        primary_contact_id: primary.id,
        emails: Vec::new(),
        phone_numbers: Vec::new(),
        secondary_contact_ids: Vec::with_capacity(secondaries.len()),
    };

    push_unique(&mut view.emails, primary.email.as_deref());
    push_unique(&mut view.phone_numbers, primary.phone_number.as_deref());

    for s in secondaries {
        push_unique(&mut view.emails, s.email.as_deref());
        push_unique(&mut view.phone_numbers, s.phone_number.as_deref());
        view.secondary_contact_ids.push(s.id);
    }

    Ok(view)
}

fn push_unique(values: &mut Vec<String>, value: Option<&str>) {
    if let Some(v) = value {
        if !values.iter().any(|existing| existing == v) {
            values.push(v.to_string());
        }
    }
}
