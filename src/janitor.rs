//! Periodic sweep that retires idle and terminated sessions (spec §4.2,
//! §5).
//!
//! Driven by a `tokio_util`-style cancellation token the same way
//! `clawd::ipc::run`'s shutdown future gates the accept loop — except
//! here cancellation stops a ticker instead of an accept loop, and on
//! exit it tears down every live session via [`Hub::cleanup_all`].

use crate::hub::Hub;
use crate::session::Lifecycle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A cooperative stop signal. `cancel()` is idempotent; cloning shares
/// the same underlying flag.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.changed().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the sweep loop; returns once `token` is cancelled, having
/// already torn down every session via `hub.cleanup_all()`.
pub fn start(hub: Arc<Hub>, config: Arc<crate::config::HubConfig>, mut token: CancelToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep(&hub, &config).await;
                }
                _ = token.cancelled() => {
                    tracing::info!("janitor cancelled, draining all sessions");
                    hub.cleanup_all().await;
                    break;
                }
            }
        }
    })
}

/// One sweep pass: visits every tracked diagram and retires sessions
/// that have crossed their grace period (spec §4.2).
async fn sweep(hub: &Hub, config: &crate::config::HubConfig) {
    let now = Instant::now();
    for diagram_id in hub.diagram_ids().await {
        let Some(handle) = hub.get_session(diagram_id).await else { continue };
        let Some(snapshot) = handle.snapshot().await else { continue };

        let eligible = match snapshot.lifecycle {
            Lifecycle::Terminated => snapshot
                .terminated_at
                .is_some_and(|t| now.duration_since(t) >= config.terminated_grace),
            Lifecycle::Active | Lifecycle::Terminating => {
                let idle_empty = snapshot.participant_count == 0
                    && snapshot.became_empty_at.is_some_and(|t| now.duration_since(t) >= config.idle_empty_grace);
                let idle_active = now.duration_since(snapshot.last_activity) >= config.idle_active_grace;
                idle_empty || idle_active
            }
        };

        if !eligible {
            continue;
        }

        if matches!(snapshot.lifecycle, Lifecycle::Terminated) {
            hub.remove_if_terminated(diagram_id).await;
        } else {
            handle.shutdown("idle_timeout").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{AclEntry, AclPrincipal, Authorizer, Owner, Principal, ResourceType, Role};
    use crate::config::HubConfig;
    use crate::error::HubError;
    use crate::hub::AuthorizationSource;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;
    use uuid::Uuid;

    struct OpenAccess;

    #[async_trait]
    impl AuthorizationSource for OpenAccess {
        async fn load(&self, _threat_model_id: Uuid) -> Result<crate::authz::AuthorizationData, HubError> {
            Ok(crate::authz::AuthorizationData {
                resource_type: ResourceType::ThreatModel,
                owner: Owner { provider: None, id: "nobody".to_string() },
                acl: vec![AclEntry {
                    principal: AclPrincipal::Group { provider: None, name: "everyone".to_string() },
                    role: Role::Writer,
                }],
            })
        }
    }

    #[tokio::test]
    async fn cancel_token_wakes_cancelled_waiter() {
        let token = CancelToken::new();
        let mut waiter = token.clone();
        token.cancel();
        tokio::time::timeout(StdDuration::from_millis(100), waiter.cancelled()).await.unwrap();
        assert!(waiter.is_cancelled());
    }

    #[tokio::test]
    async fn sweep_removes_idle_empty_session_past_grace() {
        let mut config = HubConfig::new(None, Some(tempfile::tempdir().unwrap().into_path()), None, true);
        config.idle_empty_grace = StdDuration::from_millis(1);
        let config = Arc::new(config);
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(Hub::new(store, Arc::new(OpenAccess), Arc::new(Authorizer::default()), Arc::clone(&config)));

        let resource = OpenAccess.load(Uuid::new_v4()).await.unwrap();
        let diagram_id = Uuid::new_v4();
        let principal = Principal { user_id: "host-1".to_string(), ..Default::default() };
        hub.create_session(diagram_id, Uuid::new_v4(), principal, resource).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        sweep(&hub, &config).await;

        let handle = hub.get_session(diagram_id).await.unwrap();
        // Shutdown was requested; give the event loop a moment to drain.
        tokio::time::sleep(StdDuration::from_millis(150)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.lifecycle, Lifecycle::Terminated);
    }
}
