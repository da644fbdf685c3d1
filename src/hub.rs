//! Top-level registry: one [`crate::session::Session`] per diagram
//! (spec §4.1).
//!
//! Grounded on `clawd::session::SessionManager`'s CRUD surface
//! (create/list/get/delete), narrowed to the single-session-per-key
//! invariant this domain requires (one diagram, at most one live
//! collaborative session at a time) instead of the daemon's many
//! concurrent agent sessions.

use crate::authz::{AuthorizationData, Authorizer, Principal, Role};
use crate::config::HubConfig;
use crate::error::HubError;
use crate::session::{Lifecycle, Session, SessionHandle};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Resolves the ACL governing a threat model. Separate from [`Store`]
/// because the diagram body and its authorization data are typically
/// owned by different upstream services (spec §6: the core "does not
/// verify tokens" and receives authorization context on the request).
#[async_trait]
pub trait AuthorizationSource: Send + Sync {
    async fn load(&self, threat_model_id: Uuid) -> Result<AuthorizationData, HubError>;
}

struct Entry {
    handle: SessionHandle,
    host_user_id: String,
}

/// Owns the map from diagram id to its live session. Exclusively owned
/// by the process — nothing outside `Hub` ever inserts or removes an
/// entry (spec §3 ownership rules).
pub struct Hub {
    sessions: Mutex<HashMap<Uuid, Entry>>,
    store: Arc<dyn Store>,
    authz_source: Arc<dyn AuthorizationSource>,
    authorizer: Arc<Authorizer>,
    config: Arc<HubConfig>,
}

impl Hub {
    pub fn new(
        store: Arc<dyn Store>,
        authz_source: Arc<dyn AuthorizationSource>,
        authorizer: Arc<Authorizer>,
        config: Arc<HubConfig>,
    ) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), store, authz_source, authorizer, config }
    }

    pub async fn get_session(&self, diagram_id: Uuid) -> Option<SessionHandle> {
        self.sessions.lock().await.get(&diagram_id).map(|e| e.handle.clone())
    }

    pub async fn create_session(
        &self,
        diagram_id: Uuid,
        threat_model_id: Uuid,
        host_principal: Principal,
        resource: AuthorizationData,
    ) -> Result<SessionHandle, HubError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&diagram_id) {
            return Err(HubError::AlreadyExists);
        }
        let handle = Session::spawn(
            Uuid::new_v4(),
            diagram_id,
            threat_model_id,
            host_principal.user_id.clone(),
            resource,
            Arc::clone(&self.store),
            Arc::clone(&self.authorizer),
            Arc::clone(&self.config),
        );
        sessions.insert(diagram_id, Entry { handle: handle.clone(), host_user_id: host_principal.user_id });
        Ok(handle)
    }

    pub async fn join_session(&self, diagram_id: Uuid) -> Result<SessionHandle, HubError> {
        self.sessions.lock().await.get(&diagram_id).map(|e| e.handle.clone()).ok_or(HubError::NotFound)
    }

    pub async fn get_or_create(
        &self,
        diagram_id: Uuid,
        threat_model_id: Uuid,
        principal: Principal,
        resource: AuthorizationData,
    ) -> Result<SessionHandle, HubError> {
        if let Ok(existing) = self.join_session(diagram_id).await {
            return Ok(existing);
        }
        match self.create_session(diagram_id, threat_model_id, principal, resource).await {
            Ok(handle) => Ok(handle),
            Err(HubError::AlreadyExists) => self.join_session(diagram_id).await,
            Err(e) => Err(e),
        }
    }

    /// Diagrams whose live session this principal hosts. A coarser
    /// surface than "every session the principal has ever joined" —
    /// documented in DESIGN.md as the Open Question resolution for
    /// spec §4.1's `list_active_for_principal`, since per-participant
    /// membership would otherwise require querying every session's
    /// event loop on each call.
    pub async fn list_active_for_principal(&self, user_id: &str) -> Vec<Uuid> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.host_user_id == user_id)
            .map(|(diagram_id, _)| *diagram_id)
            .collect()
    }

    /// Shuts down every live session and clears the map (spec §5:
    /// "on cancel ... the Hub's cleanup_all tears down every Session").
    pub async fn cleanup_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, entry) in sessions.drain() {
            entry.handle.shutdown("hub_shutdown").await;
        }
    }

    /// Removes a single diagram's entry once its session has reached
    /// `Terminated`, called by the janitor after confirming eligibility.
    pub async fn remove_if_terminated(&self, diagram_id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(&diagram_id) {
            if let Some(snapshot) = entry.handle.snapshot().await {
                if matches!(snapshot.lifecycle, Lifecycle::Terminated) {
                    sessions.remove(&diagram_id);
                }
            }
        }
    }

    pub async fn diagram_ids(&self) -> Vec<Uuid> {
        self.sessions.lock().await.keys().copied().collect()
    }

    /// Validates ids and principal, resolves or creates the diagram's
    /// session, reconciles an optional client-supplied `session_id`,
    /// and confirms the session is still accepting participants (spec
    /// §4.1). Origin validation happens in the HTTP layer before this
    /// is called — see `crate::server`.
    pub async fn handle_upgrade(
        &self,
        diagram_id: Uuid,
        threat_model_id: Uuid,
        principal: Principal,
        session_id_query: Option<Uuid>,
    ) -> Result<SessionHandle, HubError> {
        if principal.is_anonymous() {
            return Err(HubError::Unauthenticated);
        }

        let resource = self.authz_source.load(threat_model_id).await?;
        if !self.authorizer.check(&principal, Role::Reader, &resource).await {
            return Err(HubError::Forbidden);
        }

        let handle = self.get_or_create(diagram_id, threat_model_id, principal, resource).await?;

        if let Some(requested) = session_id_query {
            if requested != handle.id {
                return Err(HubError::SessionIdMismatch { canonical: handle.id.to_string() });
            }
        }

        let snapshot = handle.snapshot().await.ok_or(HubError::SessionTerminated)?;
        if !matches!(snapshot.lifecycle, Lifecycle::Active) {
            return Err(HubError::SessionTerminated);
        }

        Ok(handle)
    }
}
