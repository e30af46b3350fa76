//! Cluster resolution for identra.
//!
//! Given an email and/or phone number, the resolver decides whether the
//! request describes a new identity, new information about a known identity,
//! or proof that two known identities are the same person, and applies that
//! decision to the contact store in one transaction:
//!
//! 1. **Seed lookup** of every contact sharing the email or the phone
//! 2. **No match**: create a primary
//! 3. **Several owning primaries**: fold all of them into the oldest
//! 4. **Novel fragment**: attach a secondary to the surviving primary
//!
//! Each transaction holds the identity locks for the request's fragments,
//! and is retried when the store reports a concurrent modification.

pub mod resolver;

pub use resolver::{ClusterResolver, Outcome, Resolution};
