//! The cluster resolver.

use std::collections::HashSet;
use std::sync::Arc;

use identra_config::ResolverConfig;
use identra_core::{
    Contact, ContactId, ContactStore, ContactTransaction, Error, IdentityQuery, IdentityView,
    NewContact, Result, build_view,
};
use tracing::{debug, info, warn};

/// What one committed resolution did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No contact matched; a new primary was created.
    Created,
    /// A secondary carrying new information joined an existing cluster.
    Attached,
    /// Two or more clusters were folded into the oldest.
    Merged,
    /// The request was redundant with what the store already knew.
    Unchanged,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Attached => "attached",
            Outcome::Merged => "merged",
            Outcome::Unchanged => "unchanged",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical cluster after a resolution, plus what changed.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Every live contact of the identity, oldest first.
    pub cluster: Vec<Contact>,
    /// The contact inserted by this resolution, if any.
    pub created: Option<ContactId>,
    /// Primaries turned into secondaries by a merge.
    pub demoted: Vec<ContactId>,
}

impl Resolution {
    /// Id of the cluster's primary.
    pub fn primary_id(&self) -> Option<ContactId> {
        self.cluster.iter().find(|c| c.is_primary()).map(|c| c.id)
    }

    pub fn outcome(&self) -> Outcome {
        match (self.created, self.demoted.is_empty()) {
            (_, false) => Outcome::Merged,
            (Some(id), true) if self.primary_id() == Some(id) => Outcome::Created,
            (Some(_), true) => Outcome::Attached,
            (None, true) => Outcome::Unchanged,
        }
    }
}

/// Reconciles identity fragments against a [`ContactStore`].
pub struct ClusterResolver {
    store: Arc<dyn ContactStore>,
    max_retries: u32,
}

impl ClusterResolver {
    pub fn new(store: Arc<dyn ContactStore>, config: &ResolverConfig) -> Self {
        Self {
            store,
            max_retries: config.max_retries,
        }
    }

    /// Set how many times a conflicting transaction is retried.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Resolve a fragment and project the result into its view.
    pub async fn identify(
        &self,
        email: Option<String>,
        phone_number: Option<String>,
    ) -> Result<IdentityView> {
        let resolution = self.resolve(email, phone_number).await?;
        build_view(&resolution.cluster)
    }

    /// Resolve a fragment to its canonical cluster, creating, attaching or
    /// merging as needed.
    ///
    /// Fails with `InvalidRequest` before touching the store when both
    /// fragments are absent or empty.
    pub async fn resolve(
        &self,
        email: Option<String>,
        phone_number: Option<String>,
    ) -> Result<Resolution> {
        let query = IdentityQuery::new(email, phone_number)?;

        let mut attempt = 0;
        loop {
            match self.resolve_once(&query).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, max_retries = self.max_retries, error = %e, "Resolution conflicted, retrying");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    async fn resolve_once(&self, query: &IdentityQuery) -> Result<Resolution> {
        let mut tx = self.store.begin(&query.lock_keys()).await?;

        match reconcile(tx.as_mut(), query).await {
            Ok(resolution) => {
                tx.commit().await?;
                info!(
                    outcome = %resolution.outcome(),
                    primary_id = ?resolution.primary_id(),
                    created = ?resolution.created,
                    demoted = ?resolution.demoted,
                    "Identity resolved"
                );
                Ok(resolution)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed; dropping transaction");
                }
                Err(e)
            }
        }
    }
}

/// The read-decide-write sequence, run inside one transaction.
async fn reconcile(tx: &mut dyn ContactTransaction, query: &IdentityQuery) -> Result<Resolution> {
    let email = query.email();
    let phone_number = query.phone_number();

    let matches = tx.find_by_email_or_phone(email, phone_number).await?;
    debug!(matches = matches.len(), "Seed lookup");

    if matches.is_empty() {
        let contact = tx
            .create(NewContact::primary(
                email.map(str::to_owned),
                phone_number.map(str::to_owned),
            ))
            .await?;
        return Ok(Resolution {
            created: Some(contact.id),
            cluster: vec![contact],
            demoted: Vec::new(),
        });
    }

    let mut primary_ids: Vec<ContactId> = matches.iter().map(Contact::primary_id).collect();
    primary_ids.sort_unstable();
    primary_ids.dedup();

    let mut primaries: Vec<Contact> = Vec::with_capacity(primary_ids.len());
    let mut cluster: Vec<Contact> = Vec::new();
    let mut seen: HashSet<ContactId> = HashSet::new();
    for primary_id in primary_ids {
        let members = tx.find_cluster(primary_id).await?;
        let primary = members
            .iter()
            .find(|c| c.id == primary_id && c.is_primary())
            .cloned()
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "contact {primary_id} is referenced as a primary but is not a live primary"
                ))
            })?;
        primaries.push(primary);
        cluster.extend(members.into_iter().filter(|c| seen.insert(c.id)));
    }

    primaries.sort_by_key(Contact::age_key);
    let survivor = primaries[0].id;
    let mut demoted = Vec::with_capacity(primaries.len() - 1);

    if primaries.len() > 1 {
        for younger in &primaries[1..] {
            let moved = tx.repoint(younger.id, survivor).await?;
            tx.demote(younger.id, survivor).await?;
            debug!(demoted = younger.id, survivor, moved, "Folded cluster into survivor");
            demoted.push(younger.id);
        }
        cluster = tx.find_cluster(survivor).await?;
    }

    let email_known = email.is_none_or(|e| cluster.iter().any(|c| c.email.as_deref() == Some(e)));
    let phone_known = phone_number
        .is_none_or(|p| cluster.iter().any(|c| c.phone_number.as_deref() == Some(p)));

    let mut created = None;
    if !(email_known && phone_known) {
        let contact = tx
            .create(NewContact::secondary(
                email.map(str::to_owned),
                phone_number.map(str::to_owned),
                survivor,
            ))
            .await?;
        created = Some(contact.id);
        cluster = tx.find_cluster(survivor).await?;
    }

    Ok(Resolution {
        cluster,
        created,
        demoted,
    })
}
