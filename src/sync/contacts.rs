// Contact directory
// Cache of our accepted contacts and pending requests in both directions.
// Accepted relationships are two directed rows; a request is one pending row.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

use crate::models::{Contact, ContactRequest, ContactStatus};
use super::backend::Backend;
use super::{SyncError, SyncResult};

#[derive(Default)]
struct DirectoryState {
    /// Rows owned by us, any status
    own: Vec<Contact>,
    incoming: Vec<ContactRequest>,
}

impl DirectoryState {
    fn own_row(&self, contact_id: &str) -> Option<&Contact> {
        self.own.iter().find(|c| c.contact_id == contact_id)
    }

    fn upsert_own(&mut self, row: Contact) {
        match self.own.iter_mut().find(|c| c.contact_id == row.contact_id) {
            Some(existing) => *existing = row,
            None => self.own.push(row),
        }
    }

    fn ids_with(&self, status: ContactStatus) -> Vec<String> {
        self.own
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.contact_id.clone())
            .collect()
    }
}

/// What `add_contact` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    RequestSent,
    /// The other user had already asked us; their request was accepted
    Accepted,
}

#[derive(Clone)]
pub struct ContactDirectory {
    backend: Arc<dyn Backend>,
    self_id: String,
    state: Arc<TokioMutex<DirectoryState>>,
}

impl ContactDirectory {
    pub fn new(backend: Arc<dyn Backend>, self_id: &str) -> Self {
        ContactDirectory {
            backend,
            self_id: self_id.to_string(),
            state: Arc::new(TokioMutex::new(DirectoryState::default())),
        }
    }

    /// Refresh contacts and inbound requests from the backend
    pub async fn load(&self) -> SyncResult<()> {
        let own = self
            .backend
            .fetch_contacts(&self.self_id)
            .await
            .map_err(|e| SyncError::Load(e.to_string()))?;
        let requests = self
            .backend
            .fetch_contact_requests(&self.self_id)
            .await
            .map_err(|e| SyncError::Load(e.to_string()))?;

        let mut state = self.state.lock().await;
        state.own = own;
        state.incoming = requests
            .into_iter()
            .map(|row| ContactRequest {
                requester_id: row.user_id,
                requested_at: row.created_at,
            })
            .collect();
        info!(
            "Loaded {} contacts and {} pending requests for {}",
            state.ids_with(ContactStatus::Accepted).len(),
            state.incoming.len(),
            self.self_id
        );
        Ok(())
    }

    /// Ask `contact_id` to become a contact.
    ///
    /// # Returns
    ///
    /// `AddOutcome::Accepted` when `contact_id` had already requested us, in
    /// which case their request is accepted instead of sending a crossing one.
    pub async fn add_contact(&self, contact_id: &str) -> SyncResult<AddOutcome> {
        let contact_id = contact_id.trim();
        if contact_id.is_empty() {
            return Err(SyncError::InvalidInput("contact id is empty".to_string()));
        }
        if contact_id == self.self_id {
            return Err(SyncError::InvalidInput("cannot add yourself as a contact".to_string()));
        }

        let crossing = {
            let state = self.state.lock().await;
            if let Some(row) = state.own_row(contact_id) {
                let reason = match row.status {
                    ContactStatus::Accepted => "already a contact",
                    ContactStatus::Pending => "request already sent",
                    ContactStatus::Blocked => "contact is blocked",
                };
                return Err(SyncError::InvalidInput(format!("{}: {}", contact_id, reason)));
            }
            state.incoming.iter().any(|r| r.requester_id == contact_id)
        };

        if crossing {
            debug!("{} already requested {}, accepting instead", contact_id, self.self_id);
            self.accept_request(contact_id).await?;
            return Ok(AddOutcome::Accepted);
        }

        let row = self
            .backend
            .insert_contact(&self.self_id, contact_id, ContactStatus::Pending)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;
        self.state.lock().await.upsert_own(row);
        info!("Sent contact request from {} to {}", self.self_id, contact_id);
        Ok(AddOutcome::RequestSent)
    }

    /// Promote `requester_id`'s pending request and create our reverse row
    pub async fn accept_request(&self, requester_id: &str) -> SyncResult<()> {
        self.backend
            .update_contact_status(requester_id, &self.self_id, ContactStatus::Accepted, Some(ContactStatus::Pending))
            .await
            .map_err(|e| {
                error!("Failed to accept request from {}: {}", requester_id, e);
                SyncError::NotFound(format!("pending request from {}", requester_id))
            })?;

        let existing = self.state.lock().await.own_row(requester_id).cloned();
        let reverse = match existing {
            Some(_) => {
                self.backend
                    .update_contact_status(&self.self_id, requester_id, ContactStatus::Accepted, None)
                    .await
            }
            None => {
                self.backend
                    .insert_contact(&self.self_id, requester_id, ContactStatus::Accepted)
                    .await
            }
        }
        .map_err(|e| SyncError::Backend(e.to_string()))?;

        let mut state = self.state.lock().await;
        state.upsert_own(reverse);
        state.incoming.retain(|r| r.requester_id != requester_id);
        info!("{} accepted contact request from {}", self.self_id, requester_id);
        Ok(())
    }

    /// Delete `requester_id`'s pending request
    pub async fn decline_request(&self, requester_id: &str) -> SyncResult<()> {
        self.backend
            .delete_contact(requester_id, &self.self_id)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;
        self.state
            .lock()
            .await
            .incoming
            .retain(|r| r.requester_id != requester_id);
        info!("{} declined contact request from {}", self.self_id, requester_id);
        Ok(())
    }

    /// Delete the relationship in both directions
    pub async fn remove_contact(&self, contact_id: &str) -> SyncResult<()> {
        self.backend
            .delete_contact(&self.self_id, contact_id)
            .await
            .map_err(|e| SyncError::Backend(e.to_string()))?;
        if let Err(e) = self.backend.delete_contact(contact_id, &self.self_id).await {
            // Our side is gone; the reverse row no longer grants anything on its own
            warn!("Failed to delete reverse contact row {} -> {}: {}", contact_id, self.self_id, e);
        }
        let mut state = self.state.lock().await;
        state.own.retain(|c| c.contact_id != contact_id);
        state.incoming.retain(|r| r.requester_id != contact_id);
        info!("{} removed contact {}", self.self_id, contact_id);
        Ok(())
    }

    /// Mark our row for `contact_id` as blocked, creating it if needed
    pub async fn block_contact(&self, contact_id: &str) -> SyncResult<()> {
        if contact_id == self.self_id {
            return Err(SyncError::InvalidInput("cannot block yourself".to_string()));
        }
        let existing = self.state.lock().await.own_row(contact_id).cloned();
        let row = match existing {
            Some(_) => {
                self.backend
                    .update_contact_status(&self.self_id, contact_id, ContactStatus::Blocked, None)
                    .await
            }
            None => {
                self.backend
                    .insert_contact(&self.self_id, contact_id, ContactStatus::Blocked)
                    .await
            }
        }
        .map_err(|e| SyncError::Backend(e.to_string()))?;

        let had_request = self
            .state
            .lock()
            .await
            .incoming
            .iter()
            .any(|r| r.requester_id == contact_id);
        if had_request {
            if let Err(e) = self.backend.delete_contact(contact_id, &self.self_id).await {
                warn!("Failed to drop pending request from blocked {}: {}", contact_id, e);
            }
        }

        let mut state = self.state.lock().await;
        state.upsert_own(row);
        state.incoming.retain(|r| r.requester_id != contact_id);
        info!("{} blocked {}", self.self_id, contact_id);
        Ok(())
    }

    /// Accepted contact ids
    pub async fn contacts(&self) -> Vec<String> {
        self.state.lock().await.ids_with(ContactStatus::Accepted)
    }

    /// Requests we sent that are still pending
    pub async fn outgoing_requests(&self) -> Vec<String> {
        self.state.lock().await.ids_with(ContactStatus::Pending)
    }

    pub async fn incoming_requests(&self) -> Vec<ContactRequest> {
        self.state.lock().await.incoming.clone()
    }

    pub async fn blocked(&self) -> Vec<String> {
        self.state.lock().await.ids_with(ContactStatus::Blocked)
    }

    pub async fn is_contact(&self, contact_id: &str) -> bool {
        self.state
            .lock()
            .await
            .own_row(contact_id)
            .map_or(false, |c| c.status == ContactStatus::Accepted)
    }
}
