use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::storage::{Expect, Namespace, StateStore, StoreError, StoredRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
    /// Strictly increasing per key across holders.
    pub fencing_token: u64,
}

impl Lease {
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired(Lease),
    Contended {
        holder: Option<String>,
        expires_at_ms: Option<u64>,
    },
}

/// Time-bounded exclusive claims stored in the lease namespace. Acquisition
/// is a conditional write, so at most one live lease exists per key no matter
/// how many workers race for it.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn StateStore>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn current(&self, key: &str) -> Result<Option<Lease>, StoreError> {
        match self.store.get(Namespace::Lease, key).await? {
            Some(record) => Ok(Some(record.decode(Namespace::Lease)?)),
            None => Ok(None),
        }
    }

    pub async fn acquire(
        &self,
        key: &str,
        holder: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<LeaseOutcome, StoreError> {
        let existing = self.store.get(Namespace::Lease, key).await?;
        let (expect, next_token) = match existing.as_ref() {
            Some(record) => {
                let lease: Lease = record.decode(Namespace::Lease)?;
                if lease.is_live(now_ms) {
                    return Ok(LeaseOutcome::Contended {
                        holder: Some(lease.holder),
                        expires_at_ms: Some(lease.expires_at_ms),
                    });
                }
                (Expect::Revision(record.rev), lease.fencing_token + 1)
            }
            None => (Expect::Absent, 1),
        };
        let lease = Lease {
            key: key.to_string(),
            holder: holder.to_string(),
            acquired_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
            fencing_token: next_token,
        };
        match self.write(&lease, expect).await {
            Ok(_) => Ok(LeaseOutcome::Acquired(lease)),
            Err(err) if err.is_conflict() => {
                let winner = self.current(key).await?;
                Ok(LeaseOutcome::Contended {
                    holder: winner.as_ref().map(|lease| lease.holder.clone()),
                    expires_at_ms: winner.map(|lease| lease.expires_at_ms),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Extends a lease this holder still owns. `None` means it was lost.
    pub async fn renew(
        &self,
        lease: &Lease,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<Option<Lease>, StoreError> {
        let Some(record) = self.owned_record(lease, now_ms).await? else {
            return Ok(None);
        };
        let renewed = Lease {
            expires_at_ms: now_ms.saturating_add(ttl_ms),
            ..lease.clone()
        };
        match self.write(&renewed, Expect::Revision(record.rev)).await {
            Ok(_) => Ok(Some(renewed)),
            Err(err) if err.is_conflict() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Expires the lease in place so the fencing token keeps counting up.
    pub async fn release(&self, lease: &Lease, now_ms: u64) -> Result<bool, StoreError> {
        let Some(record) = self.owned_record(lease, now_ms).await? else {
            return Ok(false);
        };
        let released = Lease {
            expires_at_ms: now_ms,
            ..lease.clone()
        };
        match self.write(&released, Expect::Revision(record.rev)).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_conflict() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn owned_record(
        &self,
        lease: &Lease,
        now_ms: u64,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let Some(record) = self.store.get(Namespace::Lease, &lease.key).await? else {
            return Ok(None);
        };
        let stored: Lease = record.decode(Namespace::Lease)?;
        let owned = stored.holder == lease.holder
            && stored.fencing_token == lease.fencing_token
            && stored.is_live(now_ms);
        Ok(owned.then_some(record))
    }

    async fn write(&self, lease: &Lease, expect: Expect) -> Result<StoredRecord, StoreError> {
        let value = serde_json::to_value(lease).map_err(|err| StoreError::Decode {
            namespace: Namespace::Lease,
            key: lease.key.clone(),
            detail: err.to_string(),
        })?;
        self.store
            .put(Namespace::Lease, &lease.key, value, expect)
            .await
    }
}
