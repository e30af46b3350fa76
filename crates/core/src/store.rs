//! Contact store traits: the persistence boundary.
//!
//! A [`ContactStore`] hands out one [`ContactTransaction`] per resolution.
//! Every read and write of that resolution runs inside the transaction, and
//! nothing becomes visible until [`ContactTransaction::commit`]. Dropping a
//! transaction without committing rolls it back.
//!
//! All reads filter out soft-deleted rows and return contacts oldest first
//! (`created_at` ascending, ties broken by id).

use async_trait::async_trait;

use crate::contact::{Contact, ContactId, NewContact};
use crate::error::StoreError;
use crate::query::LockKey;

/// The core ContactStore trait.
///
/// Implementations: SQLite, PostgreSQL, in-memory (for testing).
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "postgres", "memory").
    fn name(&self) -> &str;

    /// Create the schema if it does not exist. Idempotent.
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Open a transaction holding the mutual-exclusion locks for `keys`.
    ///
    /// Acquisition waits a bounded time for both a connection and the locks.
    /// The locks are released when the transaction commits or rolls back.
    async fn begin(&self, keys: &[LockKey]) -> Result<Box<dyn ContactTransaction>, StoreError>;

    /// Drain and close pooled connections. Called once at shutdown.
    async fn close(&self);
}

/// One atomic unit of work against the store.
#[async_trait]
pub trait ContactTransaction: Send {
    /// Every contact whose email equals `email` OR whose phone equals `phone`.
    /// Empty when both are absent.
    async fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError>;

    /// The primary `primary_id` plus every contact linked to it.
    async fn find_cluster(&mut self, primary_id: ContactId) -> Result<Vec<Contact>, StoreError>;

    /// Insert a contact.
    ///
    /// Fails with `ConstraintViolation` when neither email nor phone is
    /// present, and with `Conflict` when a secondary's `linked_id` does not
    /// name a live primary.
    async fn create(&mut self, contact: NewContact) -> Result<Contact, StoreError>;

    /// Turn `contact_id` into a secondary of `new_primary_id`.
    ///
    /// The contact must have no live secondaries of its own (re-point them
    /// first) and the target must be a live primary.
    async fn demote(
        &mut self,
        contact_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<(), StoreError>;

    /// Re-link every contact linked to `old_primary_id` onto `new_primary_id`.
    /// Returns the number of contacts moved.
    async fn repoint(
        &mut self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
