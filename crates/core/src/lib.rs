//! # identra core
//!
//! Domain types, traits, and error definitions for the identra identity
//! reconciliation service. This crate has **no framework dependencies**: it
//! defines the model every other crate implements against.
//!
//! The persistence boundary is a trait here ([`ContactStore`]); backends live
//! in `identra-store`, the reconciliation algorithm in `identra-resolver`.

pub mod contact;
pub mod error;
pub mod query;
pub mod store;
pub mod view;

// Re-export key types at crate root for ergonomics
pub use contact::{Contact, ContactId, LinkPrecedence, NewContact};
pub use error::{Error, Result, StoreError};
pub use query::{IdentityQuery, LockKey};
pub use store::{ContactStore, ContactTransaction};
pub use view::{IdentityView, build_view};
