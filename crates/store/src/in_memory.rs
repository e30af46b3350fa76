//! In-memory backend: useful for testing and ephemeral deployments.
//!
//! A transaction takes the whole store under one async mutex and works on a
//! private copy of the rows; commit swaps the copy in, rollback drops it.

use async_trait::async_trait;
use chrono::Utc;
use identra_core::contact::sort_by_age;
use identra_core::{
    Contact, ContactId, ContactStore, ContactTransaction, LinkPrecedence, LockKey, NewContact,
    StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Rows {
    contacts: Vec<Contact>,
    last_id: ContactId,
}

impl Rows {
    fn live(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter().filter(|c| c.deleted_at.is_none())
    }

    fn live_mut(&mut self) -> impl Iterator<Item = &mut Contact> {
        self.contacts.iter_mut().filter(|c| c.deleted_at.is_none())
    }

    fn live_by_id(&self, id: ContactId) -> Option<&Contact> {
        self.live().find(|c| c.id == id)
    }

    fn require_primary(&self, id: ContactId) -> Result<(), StoreError> {
        match self.live_by_id(id) {
            Some(c) if c.is_primary() => Ok(()),
            Some(_) => Err(StoreError::Conflict(format!(
                "contact {id} is no longer a primary"
            ))),
            None => Err(StoreError::Conflict(format!("contact {id} does not exist"))),
        }
    }
}

/// An in-memory contact store.
pub struct InMemoryStore {
    rows: Arc<Mutex<Rows>>,
    lock_timeout: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            rows: Arc::new(Mutex::new(Rows::default())),
            lock_timeout,
        }
    }

    /// Every row, soft-deleted ones included, oldest first.
    pub async fn snapshot(&self) -> Vec<Contact> {
        let mut all = self.rows.lock().await.contacts.clone();
        sort_by_age(&mut all);
        all
    }

    /// Mark a contact as deleted. Returns `false` if it was already gone.
    pub async fn soft_delete(&self, id: ContactId) -> bool {
        let mut rows = self.rows.lock().await;
        match rows.live_mut().find(|c| c.id == id) {
            Some(c) => {
                c.deleted_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContactStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn begin(&self, keys: &[LockKey]) -> Result<Box<dyn ContactTransaction>, StoreError> {
        let guard = tokio::time::timeout(self.lock_timeout, self.rows.clone().lock_owned())
            .await
            .map_err(|_| {
                StoreError::LockTimeout(format!(
                    "store busy for {}ms",
                    self.lock_timeout.as_millis()
                ))
            })?;
        debug!(keys = keys.len(), "In-memory transaction started");
        let working = (*guard).clone();
        Ok(Box::new(InMemoryTransaction { guard, working }))
    }

    async fn close(&self) {}
}

/// A transaction over a private copy of the rows.
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Rows>,
    working: Rows,
}

#[async_trait]
impl ContactTransaction for InMemoryTransaction {
    async fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError> {
        if email.is_none() && phone_number.is_none() {
            return Ok(Vec::new());
        }
        let mut found: Vec<Contact> = self
            .working
            .live()
            .filter(|c| {
                (email.is_some() && c.email.as_deref() == email)
                    || (phone_number.is_some() && c.phone_number.as_deref() == phone_number)
            })
            .cloned()
            .collect();
        sort_by_age(&mut found);
        Ok(found)
    }

    async fn find_cluster(&mut self, primary_id: ContactId) -> Result<Vec<Contact>, StoreError> {
        let mut cluster: Vec<Contact> = self
            .working
            .live()
            .filter(|c| c.id == primary_id || c.linked_id == Some(primary_id))
            .cloned()
            .collect();
        sort_by_age(&mut cluster);
        Ok(cluster)
    }

    async fn create(&mut self, contact: NewContact) -> Result<Contact, StoreError> {
        if !contact.has_fragment() {
            return Err(StoreError::ConstraintViolation(
                "contact needs an email or a phone number".into(),
            ));
        }
        if let Some(primary_id) = contact.linked_id() {
            self.working.require_primary(primary_id)?;
        }

        let now = Utc::now();
        self.working.last_id += 1;
        let row = Contact {
            id: self.working.last_id,
            email: contact.email().map(String::from),
            phone_number: contact.phone_number().map(String::from),
            linked_id: contact.linked_id(),
            link_precedence: contact.precedence(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.working.contacts.push(row.clone());
        Ok(row)
    }

    async fn demote(
        &mut self,
        contact_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<(), StoreError> {
        if contact_id == new_primary_id {
            return Err(StoreError::ConstraintViolation(format!(
                "contact {contact_id} cannot link to itself"
            )));
        }
        self.working.require_primary(new_primary_id)?;
        self.working.require_primary(contact_id)?;
        if self
            .working
            .live()
            .any(|c| c.linked_id == Some(contact_id))
        {
            return Err(StoreError::Conflict(format!(
                "contact {contact_id} still has secondaries"
            )));
        }

        let now = Utc::now();
        if let Some(c) = self.working.live_mut().find(|c| c.id == contact_id) {
            c.link_precedence = LinkPrecedence::Secondary;
            c.linked_id = Some(new_primary_id);
            c.updated_at = now;
        }
        Ok(())
    }

    async fn repoint(
        &mut self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<u64, StoreError> {
        if old_primary_id == new_primary_id {
            return Err(StoreError::ConstraintViolation(format!(
                "cannot re-point contact {old_primary_id} onto itself"
            )));
        }
        self.working.require_primary(new_primary_id)?;

        let now = Utc::now();
        let mut moved = 0;
        for c in self
            .working
            .live_mut()
            .filter(|c| c.linked_id == Some(old_primary_id))
        {
            c.linked_id = Some(new_primary_id);
            c.updated_at = now;
            moved += 1;
        }
        Ok(moved)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
