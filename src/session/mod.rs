//! Per-diagram collaborative session: a single event-loop task that
//! linearizes every mutation (spec §4.2, §4.4).
//!
//! Grounded on `clawd::session::SessionManager`'s register/unregister
//! shape, but generalized from "track a coding-agent session" to "own
//! one diagram's live WebSocket participants." The event loop itself —
//! one task draining an mpsc command channel — mirrors the daemon's
//! `run()` accept loop pattern in `clawd::ipc::mod`, scaled down to one
//! task per diagram instead of one per whole process.

pub mod presenter;

use crate::authz::{AuthorizationData, Authorizer, Principal, Role};
use crate::diagram::Cell;
use crate::history::{HistoryEntry, OperationHistory};
use crate::processor::{self, CellOp, Reason};
use crate::protocol::{self, ClientMessage, LegacyEnvelope, ServerMessage, UserRef};
use crate::store::Store;
use chrono::Utc;
use presenter::PresenterState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Connection-scoped identifier — one per live WebSocket, distinct from
/// the participant's (possibly repeated, across reconnects) principal.
pub type ClientId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Terminating,
    Terminated,
}

struct Participant {
    principal: Principal,
    is_host: bool,
    tx: mpsc::Sender<ServerMessage>,
    last_seen_sequence: Option<u64>,
    anomaly_count: u32,
    joined_at: Instant,
}

/// Point-in-time view used by the janitor to decide cleanup eligibility
/// without holding the event loop open.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub lifecycle: Lifecycle,
    pub participant_count: usize,
    pub became_empty_at: Option<Instant>,
    pub last_activity: Instant,
    pub terminated_at: Option<Instant>,
}

pub enum Command {
    Register {
        client_id: ClientId,
        principal: Principal,
        tx: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<Result<(), crate::error::HubError>>,
    },
    Unregister {
        client_id: ClientId,
    },
    Inbound {
        client_id: ClientId,
        message: ClientMessage,
    },
    LegacyInbound {
        client_id: ClientId,
        envelope: LegacyEnvelope,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Shutdown {
        reason: &'static str,
    },
}

/// A cheap, cloneable reference to a running session's command channel.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub id: Uuid,
    pub diagram_id: Uuid,
    pub threat_model_id: Uuid,
    cmd_tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn register(
        &self,
        client_id: ClientId,
        principal: Principal,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Result<(), crate::error::HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register { client_id, principal, tx, reply: reply_tx })
            .await
            .map_err(|_| crate::error::HubError::SessionTerminated)?;
        reply_rx.await.map_err(|_| crate::error::HubError::SessionTerminated)?
    }

    pub async fn unregister(&self, client_id: ClientId) {
        let _ = self.cmd_tx.send(Command::Unregister { client_id }).await;
    }

    pub async fn inbound(&self, client_id: ClientId, message: ClientMessage) {
        let _ = self.cmd_tx.send(Command::Inbound { client_id, message }).await;
    }

    pub async fn legacy_inbound(&self, client_id: ClientId, envelope: LegacyEnvelope) {
        let _ = self.cmd_tx.send(Command::LegacyInbound { client_id, envelope }).await;
    }

    pub async fn snapshot(&self) -> Option<Snapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Snapshot { reply: reply_tx }).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn shutdown(&self, reason: &'static str) {
        let _ = self.cmd_tx.send(Command::Shutdown { reason }).await;
    }
}

pub struct Session {
    id: Uuid,
    diagram_id: Uuid,
    threat_model_id: Uuid,
    host_user_id: String,
    lifecycle: Lifecycle,
    presenter: PresenterState,
    next_sequence: u64,
    participants: HashMap<ClientId, Participant>,
    history: OperationHistory,
    resource: AuthorizationData,
    store: Arc<dyn Store>,
    authorizer: Arc<Authorizer>,
    config: Arc<crate::config::HubConfig>,
    last_activity: Instant,
    became_empty_at: Option<Instant>,
    terminated_at: Option<Instant>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: Uuid,
        diagram_id: Uuid,
        threat_model_id: Uuid,
        host_user_id: String,
        resource: AuthorizationData,
        store: Arc<dyn Store>,
        authorizer: Arc<Authorizer>,
        config: Arc<crate::config::HubConfig>,
    ) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let session = Session {
            id,
            diagram_id,
            threat_model_id,
            host_user_id,
            lifecycle: Lifecycle::Active,
            presenter: PresenterState::Host,
            next_sequence: 1,
            participants: HashMap::new(),
            history: OperationHistory::new(config.history_max_entries),
            resource,
            store,
            authorizer,
            config,
            last_activity: Instant::now(),
            became_empty_at: Some(Instant::now()),
            terminated_at: None,
        };
        let handle = SessionHandle { id, diagram_id, threat_model_id, cmd_tx };
        tokio::spawn(session.run(cmd_rx));
        handle
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Register { client_id, principal, tx, reply } => {
                    let result = self.on_register(client_id, principal, tx).await;
                    let _ = reply.send(result);
                }
                Command::Unregister { client_id } => self.on_unregister(client_id).await,
                Command::Inbound { client_id, message } => self.on_inbound(client_id, message).await,
                Command::LegacyInbound { client_id, envelope } => self.on_legacy_inbound(client_id, envelope).await,
                Command::Snapshot { reply } => {
                    let _ = reply.send(Snapshot {
                        lifecycle: self.lifecycle,
                        participant_count: self.participants.len(),
                        became_empty_at: self.became_empty_at,
                        last_activity: self.last_activity,
                        terminated_at: self.terminated_at,
                    });
                }
                Command::Shutdown { reason } => {
                    self.terminate(reason).await;
                }
            }
            if matches!(self.lifecycle, Lifecycle::Terminated) {
                break;
            }
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    async fn on_register(
        &mut self,
        client_id: ClientId,
        principal: Principal,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Result<(), crate::error::HubError> {
        if !matches!(self.lifecycle, Lifecycle::Active) {
            return Err(crate::error::HubError::SessionTerminated);
        }
        if !self.authorizer.check(&principal, Role::Reader, &self.resource).await {
            return Err(crate::error::HubError::Forbidden);
        }

        let is_host = principal.user_id == self.host_user_id;
        let user_ref = UserRef::from(&principal);

        // try_send, not send().await: a slow new connection must not
        // stall the event loop any more than a broadcast would.
        let _ = tx.try_send(ServerMessage::CurrentPresenter {
            presenter: self.presenter.holder_user_id(&self.host_user_id).map(|id| UserRef {
                user_id: id.to_string(),
                email: None,
                name: None,
            }),
        });
        let _ = tx.try_send(ServerMessage::ParticipantsUpdate { participants: self.participant_refs() });

        self.participants.insert(
            client_id,
            Participant { principal, is_host, tx, last_seen_sequence: None, anomaly_count: 0, joined_at: Instant::now() },
        );
        self.became_empty_at = None;
        self.touch();

        // The joiner already has its own state from the two direct sends
        // above; the broadcast only needs to reach everyone else.
        self.broadcast_except(
            Some(client_id),
            ServerMessage::Join { user: user_ref, timestamp: Utc::now() },
        )
        .await;
        self.broadcast_participants_except(Some(client_id)).await;
        Ok(())
    }

    async fn on_unregister(&mut self, client_id: ClientId) {
        let Some(participant) = self.participants.remove(&client_id) else { return };
        self.touch();

        if self.participants.is_empty() {
            self.became_empty_at = Some(Instant::now());
        }

        if participant.is_host {
            self.terminate("host_disconnected").await;
            return;
        }

        self.broadcast_except(
            None,
            ServerMessage::Leave { user: UserRef::from(&participant.principal), timestamp: Utc::now() },
        )
        .await;
        self.broadcast_participants().await;

        if self.presenter.is_held_by(&self.host_user_id, &participant.principal.user_id) {
            self.reassign_presenter().await;
        }
    }

    async fn reassign_presenter(&mut self) {
        let host_connected = self.participants.values().any(|p| p.is_host);

        let mut eligible: Vec<(Instant, Principal)> =
            self.participants.values().map(|p| (p.joined_at, p.principal.clone())).collect();
        eligible.sort_by_key(|(joined_at, _)| *joined_at);
        let mut writers = Vec::with_capacity(eligible.len());
        for (_, principal) in &eligible {
            if self.authorizer.check(principal, Role::Writer, &self.resource).await {
                writers.push(principal.user_id.clone());
            }
        }

        self.presenter = presenter::reassign(&self.host_user_id, host_connected, writers.iter().map(|s| s.as_str()));
        let presenter_ref = self.presenter.holder_user_id(&self.host_user_id).map(|id| UserRef {
            user_id: id.to_string(),
            email: None,
            name: None,
        });
        self.broadcast_except(None, ServerMessage::CurrentPresenter { presenter: presenter_ref }).await;
    }

    async fn terminate(&mut self, reason: &'static str) {
        if matches!(self.lifecycle, Lifecycle::Terminated | Lifecycle::Terminating) {
            return;
        }
        self.lifecycle = Lifecycle::Terminating;
        self.broadcast_except(None, ServerMessage::SessionEnded { reason }).await;
        tokio::time::sleep(self.config.drain_interval).await;
        self.participants.clear();
        self.lifecycle = Lifecycle::Terminated;
        self.terminated_at = Some(Instant::now());
    }

    fn participant_refs(&self) -> Vec<UserRef> {
        self.participants.values().map(|p| UserRef::from(&p.principal)).collect()
    }

    async fn broadcast_participants(&mut self) {
        self.broadcast_participants_except(None).await;
    }

    async fn broadcast_participants_except(&mut self, exclude: Option<ClientId>) {
        let refs = self.participant_refs();
        self.broadcast_except(exclude, ServerMessage::ParticipantsUpdate { participants: refs }).await;
    }

    /// Sends `msg` to every connected participant except `exclude`
    /// (spec §4.4 step 7: "broadcast ... to all participants other than
    /// the sender"). A send into a full queue drops that participant —
    /// back-pressure never blocks the event loop (spec §5).
    async fn broadcast_except(&mut self, exclude: Option<ClientId>, msg: ServerMessage) {
        let mut dead = Vec::new();
        for (id, participant) in self.participants.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if participant.tx.try_send(msg.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            self.participants.remove(&id);
        }
    }

    async fn send_to(&mut self, client_id: ClientId, msg: ServerMessage) {
        if let Some(p) = self.participants.get(&client_id) {
            if p.tx.try_send(msg).is_err() {
                self.participants.remove(&client_id);
            }
        }
    }

    async fn on_legacy_inbound(&mut self, client_id: ClientId, envelope: LegacyEnvelope) {
        if envelope.event != "update" {
            return;
        }
        let Some(op_value) = envelope.operation.clone() else { return };
        let Ok(cell) = serde_json::from_value::<Cell>(op_value) else { return };
        let patch = vec![CellOp::Update { cell }];
        self.apply_patch(client_id, Uuid::new_v4(), None, patch).await;
    }

    async fn on_inbound(&mut self, client_id: ClientId, message: ClientMessage) {
        if !self.participants.contains_key(&client_id) {
            return;
        }
        // Step 1: stated principal must match the connection's own.
        let claimed = message.user().user_id.clone();
        let actual = self.participants.get(&client_id).unwrap().principal.user_id.clone();
        if claimed != actual {
            return;
        }
        self.touch();

        match message {
            ClientMessage::DiagramOperation { operation_id, sequence_number, patch, .. } => {
                self.apply_patch(client_id, operation_id, sequence_number, patch).await;
            }
            ClientMessage::PresenterRequest { .. } => self.on_presenter_request(client_id).await,
            ClientMessage::ChangePresenter { target_user_id, .. } => self.on_change_presenter(client_id, target_user_id).await,
            ClientMessage::PresenterDenied { target_user_id, .. } => self.on_presenter_denied(client_id, target_user_id).await,
            ClientMessage::PresenterCursor { payload, .. } => self.forward_presenter_only(client_id, true, payload).await,
            ClientMessage::PresenterSelection { payload, .. } => self.forward_presenter_only(client_id, false, payload).await,
            ClientMessage::ResyncRequest { .. } => {
                self.send_to(
                    client_id,
                    ServerMessage::ResyncResponse {
                        method: "rest_api",
                        diagram_id: self.diagram_id,
                        threat_model_id: self.threat_model_id,
                    },
                )
                .await;
            }
            ClientMessage::UndoRequest { .. } => self.on_undo_request(client_id).await,
            ClientMessage::RedoRequest { .. } => self.on_redo_request(client_id).await,
        }
    }

    async fn on_presenter_request(&mut self, client_id: ClientId) {
        let Some(requester) = self.participants.get(&client_id) else { return };
        if requester.is_host {
            self.presenter = PresenterState::Host;
            let presenter_ref = Some(UserRef { user_id: self.host_user_id.clone(), email: None, name: None });
            self.broadcast_except(None, ServerMessage::CurrentPresenter { presenter: presenter_ref }).await;
            return;
        }
        let requester_ref = UserRef::from(&requester.principal);
        if let Some(host_id) = self.host_client_id() {
            self.send_to(host_id, ServerMessage::PresenterRequest { requester: requester_ref }).await;
        } else {
            // Host offline: spec §4.5 auto-deny from principal `system`.
            self.send_to(client_id, ServerMessage::PresenterDenied { target_user_id: requester_ref.user_id }).await;
        }
    }

    fn host_client_id(&self) -> Option<ClientId> {
        self.participants.iter().find(|(_, p)| p.is_host).map(|(id, _)| *id)
    }

    async fn on_change_presenter(&mut self, client_id: ClientId, target_user_id: String) {
        let Some(requester) = self.participants.get(&client_id) else { return };
        if !requester.is_host {
            return;
        }
        self.presenter = PresenterState::Granted(target_user_id.clone());
        let presenter_ref = Some(UserRef { user_id: target_user_id, email: None, name: None });
        self.broadcast_except(None, ServerMessage::CurrentPresenter { presenter: presenter_ref }).await;
        self.broadcast_participants().await;
    }

    async fn on_presenter_denied(&mut self, client_id: ClientId, target_user_id: String) {
        let Some(requester) = self.participants.get(&client_id) else { return };
        if !requester.is_host {
            return;
        }
        if let Some(target_client) = self.client_id_for_user(&target_user_id) {
            self.send_to(target_client, ServerMessage::PresenterDenied { target_user_id }).await;
        }
    }

    fn client_id_for_user(&self, user_id: &str) -> Option<ClientId> {
        self.participants.iter().find(|(_, p)| p.principal.user_id == user_id).map(|(id, _)| *id)
    }

    /// `presenter_cursor`/`presenter_selection`: accepted only from the
    /// current presenter, forwarded to everyone else, no state mutation.
    async fn forward_presenter_only(&mut self, client_id: ClientId, is_cursor: bool, payload: serde_json::Value) {
        let Some(participant) = self.participants.get(&client_id) else { return };
        if !self.presenter.is_held_by(&self.host_user_id, &participant.principal.user_id) {
            return;
        }
        let user = UserRef::from(&participant.principal);
        let msg = if is_cursor {
            ServerMessage::PresenterCursor { user, payload }
        } else {
            ServerMessage::PresenterSelection { user, payload }
        };
        self.broadcast_except(Some(client_id), msg).await;
    }

    /// Spec §4.4 steps 2–7.
    async fn apply_patch(&mut self, client_id: ClientId, operation_id: Uuid, client_sequence: Option<u64>, patch: Vec<CellOp>) {
        let Some(participant) = self.participants.get(&client_id) else { return };
        let principal = participant.principal.clone();

        // Step 3: writer authorization.
        if !self.authorizer.check(&principal, Role::Writer, &self.resource).await {
            tracing::warn!(user_id = %principal.user_id, "write denied: insufficient role");
            self.send_to(client_id, ServerMessage::AuthorizationDenied { operation_id }).await;
            let cells = match processor::current_cells(self.store.as_ref(), self.diagram_id, &patch).await {
                Ok(cells) => cells,
                Err(e) => {
                    tracing::error!(err = %e, "store error reading current state for denied write");
                    patch.iter().map(|_| None).collect()
                }
            };
            self.send_to(
                client_id,
                ServerMessage::StateCorrection { reason: "unauthorized_operation".to_string(), cells },
            )
            .await;
            return;
        }

        // Step 4: client-sequence anomaly tracking.
        if let Some(seq) = client_sequence {
            let anomalous = self.record_sequence_observation(client_id, seq);
            if anomalous {
                let threshold_hit = self.participants.get(&client_id).map(|p| p.anomaly_count).unwrap_or(0)
                    >= self.config.sync_anomaly_threshold;
                if threshold_hit {
                    self.send_to(
                        client_id,
                        ServerMessage::ResyncResponse {
                            method: "rest_api",
                            diagram_id: self.diagram_id,
                            threat_model_id: self.threat_model_id,
                        },
                    )
                    .await;
                    if let Some(p) = self.participants.get_mut(&client_id) {
                        p.anomaly_count = 0;
                    }
                }
            }
        }

        // Step 5 (processor): applying the patch may still reject it, so
        // the server sequence is assigned only once that's settled —
        // otherwise a rejected patch burns a number nothing ever
        // broadcasts, leaving a gap in the series every client observes.
        let result = match processor::apply_and_persist(self.store.as_ref(), self.diagram_id, &patch).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(err = %e, "store error applying patch");
                self.send_to(
                    client_id,
                    ServerMessage::StateCorrection { reason: "save_failed".to_string(), cells: vec![] },
                )
                .await;
                return;
            }
        };

        if !result.valid {
            if result.correction_needed {
                self.send_to(
                    client_id,
                    ServerMessage::StateCorrection {
                        reason: result.reason.map(protocol::reason_code).unwrap_or("invalid").to_string(),
                        cells: result.cells_modified,
                    },
                )
                .await;
            }
            return;
        }

        if !result.state_changed {
            return;
        }

        // Step 6: assign server sequence — only a patch that actually
        // changed state gets one, keeping the broadcast series gap-free.
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;

        self.history.push(HistoryEntry {
            sequence_number,
            patch: patch.clone(),
            previous_state: result.previous_state,
        });

        self.broadcast_except(
            Some(client_id),
            ServerMessage::DiagramOperation { user: UserRef::from(&principal), operation_id, sequence_number, patch },
        )
        .await;
    }

    /// Returns true if this observation is anomalous (gap or
    /// duplicate), bumping the per-participant counter when it is.
    fn record_sequence_observation(&mut self, client_id: ClientId, seq: u64) -> bool {
        let Some(participant) = self.participants.get_mut(&client_id) else { return false };
        let anomalous = match participant.last_seen_sequence {
            None => false,
            Some(expected) if seq == expected + 1 => false,
            Some(expected) if seq <= expected => true,
            Some(_) => true,
        };
        participant.last_seen_sequence = Some(seq);
        if anomalous {
            participant.anomaly_count += 1;
        }
        anomalous
    }

    async fn on_undo_request(&mut self, client_id: ClientId) {
        let Some(participant) = self.participants.get(&client_id) else { return };
        if !self.authorizer.check(&participant.principal, Role::Writer, &self.resource).await {
            return;
        }
        let Some(entry) = self.history.undo_request().cloned() else {
            self.send_to(client_id, ServerMessage::NoOperationsToUndo).await;
            return;
        };

        if let Err(e) = self.restore_previous_state(&entry.previous_state).await {
            tracing::error!(err = %e, "undo failed to persist restored state");
            self.send_to(client_id, ServerMessage::NoOperationsToUndo).await;
            return;
        }

        self.broadcast_except(None, ServerMessage::HistoryOperation { operation: "undo", message: "resync_required" }).await;
    }

    async fn on_redo_request(&mut self, client_id: ClientId) {
        let Some(participant) = self.participants.get(&client_id) else { return };
        if !self.authorizer.check(&participant.principal, Role::Writer, &self.resource).await {
            return;
        }
        let Some(entry) = self.history.peek_redo() else {
            self.send_to(client_id, ServerMessage::NoOperationsToRedo).await;
            return;
        };
        let patch = entry.patch.clone();

        match processor::apply_and_persist(self.store.as_ref(), self.diagram_id, &patch).await {
            Ok(result) if result.valid => {
                self.history.confirm_redo();
                self.broadcast_except(None, ServerMessage::HistoryOperation { operation: "redo", message: "resync_required" }).await;
            }
            _ => {
                self.send_to(client_id, ServerMessage::ResyncResponse {
                    method: "rest_api",
                    diagram_id: self.diagram_id,
                    threat_model_id: self.threat_model_id,
                })
                .await;
            }
        }
    }

    async fn restore_previous_state(
        &self,
        previous_state: &[(Uuid, Option<Cell>)],
    ) -> Result<(), crate::error::StoreError> {
        let mut diagram = self.store.get(self.diagram_id).await?;
        for (id, snapshot) in previous_state {
            match snapshot {
                Some(cell) => {
                    if let Some(slot) = diagram.cells.iter_mut().find(|c| c.id == cell.id) {
                        *slot = cell.clone();
                    } else {
                        diagram.cells.push(cell.clone());
                    }
                }
                None => diagram.cells.retain(|c| c.id != *id),
            }
        }
        self.store.update(self.diagram_id, diagram).await
    }
}
