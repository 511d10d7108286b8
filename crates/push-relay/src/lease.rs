use serde::{Deserialize, Serialize};
use shared_slot::SharedSlot;

use crate::error::RelayResult;

/// The shared record naming which participant owns the long-poll connection.
/// Ownership is advisory: races are settled by expiry, not exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLease {
    #[serde(rename = "candidate")]
    pub owner_candidate_id: String,
    #[serde(rename = "owned")]
    pub owned_marker: bool,
    #[serde(rename = "expires_at")]
    pub lease_expires_at: u64,
}

impl ConnectionLease {
    pub fn candidate(participant_id: &str, expires_at: u64) -> Self {
        Self {
            owner_candidate_id: participant_id.to_string(),
            owned_marker: false,
            lease_expires_at: expires_at,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.lease_expires_at <= now_ms
    }

    pub fn is_held_by(&self, participant_id: &str) -> bool {
        self.owned_marker && self.owner_candidate_id == participant_id
    }

    pub fn owner(&self) -> Option<&str> {
        self.owned_marker
            .then_some(self.owner_candidate_id.as_str())
    }
}

/// This participant's accessor for the lease slot.
#[derive(Clone)]
pub struct LeaseSlot {
    slot: SharedSlot,
    participant_id: String,
}

impl LeaseSlot {
    pub fn new(slot: SharedSlot, participant_id: impl Into<String>) -> Self {
        Self {
            slot,
            participant_id: participant_id.into(),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Absent, undecodable and empty-candidate leases all read as `None`.
    pub async fn read(&self) -> RelayResult<Option<ConnectionLease>> {
        Ok(self
            .slot
            .get_json::<ConnectionLease>()
            .await?
            .filter(|lease| !lease.owner_candidate_id.is_empty()))
    }

    pub async fn write(&self, lease: &ConnectionLease) -> RelayResult<()> {
        Ok(self.slot.set_json(lease).await?)
    }

    pub async fn offer(&self, expires_at: u64) -> RelayResult<()> {
        self.write(&ConnectionLease::candidate(&self.participant_id, expires_at))
            .await
    }

    pub async fn is_held_by_me(&self) -> RelayResult<bool> {
        Ok(self
            .read()
            .await?
            .is_some_and(|lease| lease.is_held_by(&self.participant_id)))
    }

    /// Removes the lease only when this participant currently owns it.
    pub async fn release_if_owner(&self) -> RelayResult<bool> {
        if self.is_held_by_me().await? {
            self.slot.remove().await?;
            return Ok(true);
        }
        Ok(false)
    }
}
