//! C8 — Session Manager: owns in-memory `LiveSession`s, each wrapping an
//! agent adapter process. Adapters report back over an explicit
//! `tokio::sync::mpsc` channel rather than callbacks, per the corpus's own
//! `message_processor`-style preference for typed event channels.

pub mod adapter;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use crate::container::ContainerDriver;
use crate::error::{AppError, AppResult};
use crate::registry::{NewSessionSpec, SessionRegistry};
use crate::types::{AgentKind, LiveSessionStatus, Message};

pub use adapter::{Adapter, AdapterEvent, ProcessAdapter};

const RING_BUFFER_CAP: usize = 200;
const CLIENT_QUEUE_CAP: usize = 256;
const DISCONNECT_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Fan-out channel for one live session; a client attaches by subscribing.
/// Bounded so a slow client can be detected and dropped (code 1009)
/// without affecting the session itself.
pub struct LiveSession {
    pub own_id: String,
    pub workspace_name: String,
    pub agent_kind: AgentKind,
    pub model: RwLock<Option<String>>,
    pub status: RwLock<LiveSessionStatus>,
    pub agent_native_id: RwLock<Option<String>>,
    ring: Mutex<VecDeque<Message>>,
    last_id: AtomicU64,
    tx: broadcast::Sender<SessionEvent>,
    adapter: Mutex<Box<dyn Adapter>>,
    attached_clients: AtomicU64,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Message(Message),
    StatusChange(LiveSessionStatus),
    Error(String),
}

impl LiveSession {
    fn new(own_id: String, workspace_name: String, agent_kind: AgentKind, model: Option<String>, adapter: Box<dyn Adapter>) -> Self {
        let (tx, _rx) = broadcast::channel(CLIENT_QUEUE_CAP);
        Self {
            own_id,
            workspace_name,
            agent_kind,
            model: RwLock::new(model),
            status: RwLock::new(LiveSessionStatus::Idle),
            agent_native_id: RwLock::new(None),
            ring: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAP)),
            last_id: AtomicU64::new(0),
            tx,
            adapter: Mutex::new(adapter),
            attached_clients: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.attached_clients.fetch_add(1, Ordering::SeqCst);
        self.tx.subscribe()
    }

    pub fn client_disconnected(&self) -> u64 {
        self.attached_clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub async fn status(&self) -> LiveSessionStatus {
        *self.status.read().await
    }

    pub async fn model(&self) -> Option<String> {
        self.model.read().await.clone()
    }

    pub async fn native_id(&self) -> Option<String> {
        self.agent_native_id.read().await.clone()
    }

    /// Messages buffered with id strictly greater than `after`, in order.
    pub async fn replay_after(&self, after: u64) -> Vec<Message> {
        self.ring.lock().await.iter().filter(|m| m.id() > after).cloned().collect()
    }

    async fn push_to_ring(&self, message: Message) {
        let mut ring = self.ring.lock().await;
        if ring.len() >= RING_BUFFER_CAP {
            ring.pop_front();
        }
        ring.push_back(message);
    }

    pub async fn next_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn send_message(&self, text: &str) -> AppResult<()> {
        *self.status.write().await = LiveSessionStatus::Running;
        let _ = self.tx.send(SessionEvent::StatusChange(LiveSessionStatus::Running));
        self.adapter.lock().await.send_message(text).await
    }

    pub async fn set_model(&self, model: String) -> AppResult<()> {
        self.adapter.lock().await.set_model(&model).await?;
        *self.model.write().await = Some(model);
        Ok(())
    }

    /// Per §8's interrupt-no-reuse property: after this returns, the
    /// session is `idle` and a subsequent `send_message` starts a logical
    /// fresh turn — the adapter itself enforces that on its side of the
    /// interrupt protocol, this only flips the externally-visible status.
    pub async fn interrupt(&self) -> AppResult<()> {
        *self.status.write().await = LiveSessionStatus::Interrupted;
        let _ = self.tx.send(SessionEvent::StatusChange(LiveSessionStatus::Interrupted));
        self.adapter.lock().await.interrupt().await?;
        *self.status.write().await = LiveSessionStatus::Idle;
        let _ = self.tx.send(SessionEvent::StatusChange(LiveSessionStatus::Idle));
        Ok(())
    }

    pub async fn dispose(&self) {
        let _ = self.adapter.lock().await.dispose().await;
        *self.status.write().await = LiveSessionStatus::Exited;
        let _ = self.tx.send(SessionEvent::StatusChange(LiveSessionStatus::Exited));
    }
}

pub struct JoinSessionRequest {
    pub workspace_name: String,
    pub agent_kind: AgentKind,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub project_path: Option<String>,
    pub resume_from_id: Option<u64>,
}

pub enum JoinOutcome {
    Joined { session: Arc<LiveSession>, replay: Vec<Message> },
    Started { session: Arc<LiveSession> },
}

/// Orchestrates live sessions across workspaces. Depends on C1 (to spawn
/// adapter processes inside a container) and C3 (to persist the
/// session-id <-> agent-native-id linkage).
pub struct Manager {
    driver: Arc<ContainerDriver>,
    registry: Arc<SessionRegistry>,
    live: RwLock<HashMap<String, Arc<LiveSession>>>,
}

impl Manager {
    pub fn new(driver: Arc<ContainerDriver>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            driver,
            registry,
            live: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_live(&self, own_id: &str) -> Option<Arc<LiveSession>> {
        self.live.read().await.get(own_id).cloned()
    }

    /// Implements the rejoin/replay algorithm of §4.8 exactly.
    pub async fn join(&self, req: JoinSessionRequest, container_name: &str) -> AppResult<JoinOutcome> {
        if let Some(session_id) = &req.session_id {
            if let Some(session) = self.get_live(session_id).await {
                // The record persisted by C3 carries no `model` field — only
                // the in-memory live session does (§3's Live session entity).
                // `setModel` below is the entire effect; property 5 is about
                // the live record, not the on-disk one.
                if let Some(model) = &req.model {
                    if session.model().await.as_deref() != Some(model.as_str()) {
                        session.set_model(model.clone()).await?;
                    }
                }
                let replay = match req.resume_from_id {
                    Some(after) => session.replay_after(after).await,
                    None => Vec::new(),
                };
                return Ok(JoinOutcome::Joined { session, replay });
            }

            if let Some(record) = self.registry.get(session_id).await {
                let session = self
                    .spawn_session(
                        session_id.clone(),
                        record.workspace_name,
                        record.agent_kind,
                        req.model.clone(),
                        record.agent_native_id,
                        container_name,
                    )
                    .await?;
                return Ok(JoinOutcome::Started { session });
            }
        }

        let record = self
            .registry
            .create_session(NewSessionSpec {
                workspace_name: req.workspace_name.clone(),
                agent_kind: req.agent_kind,
                project_path: req.project_path.clone(),
            })
            .await?;

        let session = self
            .spawn_session(record.own_id, req.workspace_name, req.agent_kind, req.model, None, container_name)
            .await?;

        Ok(JoinOutcome::Started { session })
    }

    async fn spawn_session(
        &self,
        own_id: String,
        workspace_name: String,
        agent_kind: AgentKind,
        model: Option<String>,
        agent_native_id: Option<String>,
        container_name: &str,
    ) -> AppResult<Arc<LiveSession>> {
        let adapter = ProcessAdapter::start(self.driver.clone(), container_name.to_string(), agent_kind, agent_native_id.clone(), model.clone()).await?;

        let session = Arc::new(LiveSession::new(own_id.clone(), workspace_name, agent_kind, model, Box::new(adapter)));
        if let Some(native_id) = agent_native_id {
            *session.agent_native_id.write().await = Some(native_id);
        }

        self.live.write().await.insert(own_id, session.clone());
        self.spawn_event_pump(session.clone());
        Ok(session)
    }

    /// Drains the adapter's event channel into the ring buffer and the
    /// broadcast fan-out for as long as the session is live. Also the sole
    /// writer of a freshly-learned `agentNativeId` back into C3 (spec.md
    /// line 42: learned after the first agent reply).
    fn spawn_event_pump(&self, session: Arc<LiveSession>) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                let event = session.adapter.lock().await.next_event().await;
                match event {
                    Some(AdapterEvent::Message(msg)) => {
                        let id = session.next_id().await;
                        let msg = msg.with_id(id);
                        session.push_to_ring(msg.clone()).await;
                        let _ = session.tx.send(SessionEvent::Message(msg));
                    }
                    Some(AdapterEvent::NativeId(native_id)) => {
                        *session.agent_native_id.write().await = Some(native_id.clone());
                        if let Err(e) = registry.link_agent_session(&session.own_id, &native_id).await {
                            tracing::warn!(error = %e, "failed to persist agent native id");
                        }
                    }
                    Some(AdapterEvent::Done) => {
                        *session.status.write().await = LiveSessionStatus::Idle;
                        let _ = session.tx.send(SessionEvent::StatusChange(LiveSessionStatus::Idle));
                    }
                    Some(AdapterEvent::Error(message)) => {
                        *session.status.write().await = LiveSessionStatus::Errored;
                        let _ = session.tx.send(SessionEvent::Error(message));
                    }
                    None => {
                        *session.status.write().await = LiveSessionStatus::Exited;
                        let _ = session.tx.send(SessionEvent::StatusChange(LiveSessionStatus::Exited));
                        break;
                    }
                }
            }
        });
    }

    /// Schedules disposal after the grace period unless a client reattaches
    /// first (checked by the caller via `attached_clients` before acting).
    pub fn schedule_disconnect_disposal(self: &Arc<Self>, own_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_GRACE_PERIOD).await;
            if let Some(session) = manager.get_live(&own_id).await {
                if session.attached_clients.load(Ordering::SeqCst) == 0 {
                    session.dispose().await;
                    manager.live.write().await.remove(&own_id);
                }
            }
        });
    }

    /// Container stop: dispose every adapter for the workspace; clients are
    /// expected to be closed with code 1001 by the caller (C9's WS handler).
    pub async fn dispose_workspace(&self, workspace_name: &str) {
        let sessions: Vec<Arc<LiveSession>> = self
            .live
            .read()
            .await
            .values()
            .filter(|s| s.workspace_name == workspace_name)
            .cloned()
            .collect();

        for session in sessions {
            session.dispose().await;
            self.live.write().await.remove(&session.own_id);
        }
    }

    pub async fn interrupt(&self, own_id: &str) -> AppResult<()> {
        let session = self
            .get_live(own_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("live session {own_id}")))?;
        session.interrupt().await
    }

    /// Supplemented same-container-reuse check: is there already another
    /// live session of this agent kind on this workspace? Purely
    /// informational — surfaced as a non-fatal `warning` on `connected`.
    pub async fn has_other_live_session(&self, workspace_name: &str, agent_kind: AgentKind, excluding: &str) -> bool {
        self.live
            .read()
            .await
            .values()
            .any(|s| s.own_id != excluding && s.workspace_name == workspace_name && s.agent_kind == agent_kind)
    }

    /// Disposes every live session of the given agent kind, used by
    /// `config.refreshCredentials` so stale-credentialed adapters are
    /// replaced on next connect rather than keep running with an expired
    /// token.
    pub async fn dispose_sessions_for_agent_kind(&self, agent_kind: AgentKind) -> usize {
        let sessions: Vec<Arc<LiveSession>> = self
            .live
            .read()
            .await
            .values()
            .filter(|s| s.agent_kind == agent_kind)
            .cloned()
            .collect();

        for session in &sessions {
            session.dispose().await;
            self.live.write().await.remove(&session.own_id);
        }
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapter::tests::NullAdapter;
    use async_trait::async_trait;

    /// An adapter that replays a fixed script of events, for exercising
    /// `spawn_event_pump` without a real container process.
    struct ScriptedAdapter {
        events: VecDeque<AdapterEvent>,
    }

    #[async_trait]
    impl Adapter for ScriptedAdapter {
        async fn send_message(&mut self, _text: &str) -> AppResult<()> {
            Ok(())
        }
        async fn set_model(&mut self, _model: &str) -> AppResult<()> {
            Ok(())
        }
        async fn interrupt(&mut self) -> AppResult<()> {
            Ok(())
        }
        async fn dispose(&mut self) -> AppResult<()> {
            Ok(())
        }
        async fn next_event(&mut self) -> Option<AdapterEvent> {
            self.events.pop_front()
        }
    }

    #[tokio::test]
    async fn native_id_event_updates_live_session_and_persists_to_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new(
            dir.path().join("session-registry.json"),
            dir.path().join(".registry.lock"),
        ));
        registry.load().await.unwrap();
        let record = registry
            .create_session(NewSessionSpec {
                workspace_name: "w".to_string(),
                agent_kind: AgentKind::Claude,
                project_path: None,
            })
            .await
            .unwrap();

        let driver = Arc::new(ContainerDriver::new("true"));
        let manager = Manager::new(driver, registry.clone());

        let adapter = ScriptedAdapter { events: VecDeque::from(vec![AdapterEvent::NativeId("native-1".to_string())]) };
        let session = Arc::new(LiveSession::new(
            record.own_id.clone(),
            "w".to_string(),
            AgentKind::Claude,
            None,
            Box::new(adapter),
        ));
        manager.live.write().await.insert(record.own_id.clone(), session.clone());
        manager.spawn_event_pump(session.clone());

        for _ in 0..50 {
            if session.native_id().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(session.native_id().await.as_deref(), Some("native-1"));
        let persisted = registry.get(&record.own_id).await.unwrap();
        assert_eq!(persisted.agent_native_id.as_deref(), Some("native-1"));
    }

    #[tokio::test]
    async fn interrupt_returns_session_to_idle() {
        let session = LiveSession::new(
            "s1".to_string(),
            "w".to_string(),
            AgentKind::Claude,
            None,
            Box::new(NullAdapter::new()),
        );
        *session.status.write().await = LiveSessionStatus::Running;
        session.interrupt().await.unwrap();
        assert_eq!(session.status().await, LiveSessionStatus::Idle);
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest_beyond_cap() {
        let session = LiveSession::new(
            "s1".to_string(),
            "w".to_string(),
            AgentKind::Claude,
            None,
            Box::new(NullAdapter::new()),
        );
        for i in 0..(RING_BUFFER_CAP + 10) {
            let id = session.next_id().await;
            session
                .push_to_ring(Message::System { id, content: format!("{i}"), timestamp: chrono::Utc::now() })
                .await;
        }
        let ring = session.ring.lock().await;
        assert_eq!(ring.len(), RING_BUFFER_CAP);
    }

    #[tokio::test]
    async fn replay_after_returns_only_newer_messages() {
        let session = LiveSession::new(
            "s1".to_string(),
            "w".to_string(),
            AgentKind::Claude,
            None,
            Box::new(NullAdapter::new()),
        );
        for _ in 0..5 {
            let id = session.next_id().await;
            session
                .push_to_ring(Message::System { id, content: "x".to_string(), timestamp: chrono::Utc::now() })
                .await;
        }
        let replay = session.replay_after(3).await;
        assert_eq!(replay.len(), 2);
        assert!(replay.iter().all(|m| m.id() > 3));
    }
}
