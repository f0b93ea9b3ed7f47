//! Per-process connection hub.
//!
//! The hub owns the registry of live sessions. Every mutation and every
//! fan-out goes through one dispatch task, so register, unregister and
//! deliver requests are applied strictly in the order they were submitted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reporter::LoadReporter;

pub type SessionId = Uuid;

const DEFAULT_COMMAND_DEPTH: usize = 1024;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub command_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_buffer: DEFAULT_COMMAND_DEPTH,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    #[error("hub dispatch loop has stopped")]
    Stopped,
}

/// The hub's side of a session: the only sender into its outbound queue.
///
/// Dropping the handle closes the queue. [`SessionHandle::close`] consumes the
/// handle, so a queue can be closed at most once.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    username: String,
    outbox: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn close(self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// The session's side of the outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    receiver: mpsc::Receiver<Bytes>,
    closed: Arc<AtomicBool>,
}

impl OutboundQueue {
    /// Next payload, or `None` once the hub has closed the queue and it is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Creates a bounded outbound queue for a new session.
pub fn outbound_queue(
    id: SessionId,
    username: impl Into<String>,
    capacity: usize,
) -> (SessionHandle, OutboundQueue) {
    let (outbox, receiver) = mpsc::channel(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    (
        SessionHandle {
            id,
            username: username.into(),
            outbox,
            closed: Arc::clone(&closed),
        },
        OutboundQueue { receiver, closed },
    )
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub username: String,
}

enum HubCommand {
    Register {
        session: SessionHandle,
        ack: oneshot::Sender<bool>,
    },
    Unregister {
        id: SessionId,
        ack: oneshot::Sender<bool>,
    },
    Deliver {
        payload: Bytes,
        ack: oneshot::Sender<DeliveryReport>,
    },
    Snapshot {
        ack: oneshot::Sender<Vec<SessionSummary>>,
    },
}

/// Cloneable front door to a hub's dispatch loop.
#[derive(Clone)]
pub struct Hub {
    address: Arc<str>,
    commands: mpsc::Sender<HubCommand>,
    load: Arc<AtomicUsize>,
}

impl Hub {
    /// Starts the dispatch loop. The loop exits once every `Hub` clone is dropped.
    pub fn spawn(
        address: impl Into<String>,
        reporter: Arc<dyn LoadReporter>,
        config: HubConfig,
    ) -> (Hub, JoinHandle<()>) {
        let address: Arc<str> = Arc::from(address.into());
        let (commands, rx) = mpsc::channel(config.command_buffer.max(1));
        let load = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher {
            address: Arc::clone(&address),
            sessions: HashMap::new(),
            load: Arc::clone(&load),
            reporter,
        };
        let handle = tokio::spawn(dispatcher.run(rx));
        (
            Hub {
                address,
                commands,
                load,
            },
            handle,
        )
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Registry size as of the last applied command; may be stale on return.
    pub fn current_load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    /// Returns false when a session with the same id is already registered.
    pub async fn register(&self, session: SessionHandle) -> Result<bool, HubError> {
        self.request(|ack| HubCommand::Register { session, ack })
            .await
    }

    /// Returns true only for the call that actually removed the session.
    pub async fn unregister(&self, id: SessionId) -> Result<bool, HubError> {
        self.request(|ack| HubCommand::Unregister { id, ack }).await
    }

    pub async fn deliver_local(&self, payload: Bytes) -> Result<DeliveryReport, HubError> {
        self.request(|ack| HubCommand::Deliver { payload, ack })
            .await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, HubError> {
        self.request(|ack| HubCommand::Snapshot { ack }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (ack, reply) = oneshot::channel();
        self.commands
            .send(build(ack))
            .await
            .map_err(|_| HubError::Stopped)?;
        reply.await.map_err(|_| HubError::Stopped)
    }
}

struct Dispatcher {
    address: Arc<str>,
    sessions: HashMap<SessionId, SessionHandle>,
    load: Arc<AtomicUsize>,
    reporter: Arc<dyn LoadReporter>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Register { session, ack } => {
                    let _ = ack.send(self.register(session));
                }
                HubCommand::Unregister { id, ack } => {
                    let _ = ack.send(self.unregister(id, "disconnect"));
                }
                HubCommand::Deliver { payload, ack } => {
                    let _ = ack.send(self.deliver(payload));
                }
                HubCommand::Snapshot { ack } => {
                    let _ = ack.send(self.snapshot());
                }
            }
        }

        let remaining = self.sessions.len();
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        self.publish_load();
        debug!(address = %self.address, remaining, "hub dispatch loop stopped");
    }

    fn register(&mut self, session: SessionHandle) -> bool {
        if self.sessions.contains_key(&session.id) {
            session.close();
            return false;
        }
        let id = session.id;
        let username = session.username.clone();
        self.sessions.insert(id, session);
        self.publish_load();
        info!(
            address = %self.address,
            session_id = %id,
            username = %username,
            total = self.sessions.len(),
            "client connected"
        );
        true
    }

    fn unregister(&mut self, id: SessionId, reason: &'static str) -> bool {
        let Some(session) = self.sessions.remove(&id) else {
            return false;
        };
        let username = session.username.clone();
        session.close();
        self.publish_load();
        info!(
            address = %self.address,
            session_id = %id,
            username = %username,
            reason,
            total = self.sessions.len(),
            "client disconnected"
        );
        true
    }

    fn deliver(&mut self, payload: Bytes) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut stalled = Vec::new();

        for (id, session) in &self.sessions {
            match session.outbox.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        address = %self.address,
                        session_id = %id,
                        username = %session.username,
                        "outbound queue full; evicting slow client"
                    );
                    stalled.push((*id, "slow_consumer"));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stalled.push((*id, "writer_gone"));
                }
            }
        }

        for (id, reason) in stalled {
            if self.unregister(id, reason) {
                report.evicted += 1;
                counter!("chat_relay_sessions_evicted_total", 1, "reason" => reason);
            }
        }

        if report.delivered > 0 {
            counter!(
                "chat_relay_messages_delivered_total",
                report.delivered as u64
            );
        }
        report
    }

    fn snapshot(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .values()
            .map(|session| SessionSummary {
                id: session.id,
                username: session.username.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| a.username.cmp(&b.username).then(a.id.cmp(&b.id)));
        sessions
    }

    fn publish_load(&self) {
        let load = self.sessions.len();
        self.load.store(load, Ordering::SeqCst);
        gauge!("chat_relay_sessions_active", load as f64);
        self.reporter.report(load);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::WatchLoadReporter;

    fn spawn_hub() -> (Hub, Arc<WatchLoadReporter>) {
        let reporter = Arc::new(WatchLoadReporter::new());
        let (hub, _loop) = Hub::spawn("ws://test:1", reporter.clone(), HubConfig::default());
        (hub, reporter)
    }

    fn session(name: &str, capacity: usize) -> (SessionHandle, OutboundQueue) {
        outbound_queue(Uuid::new_v4(), name, capacity)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn register_reports_load() {
        let (hub, reporter) = spawn_hub();
        let (handle, _queue) = session("alice", 4);
        assert!(hub.register(handle).await.unwrap());
        assert_eq!(hub.current_load(), 1);
        assert_eq!(reporter.latest(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn duplicate_register_is_a_noop() {
        let (hub, _) = spawn_hub();
        let id = Uuid::new_v4();
        let (first, q1) = outbound_queue(id, "alice", 4);
        let (second, mut q2) = outbound_queue(id, "alice", 4);

        assert!(hub.register(first).await.unwrap());
        assert!(!hub.register(second).await.unwrap());
        assert_eq!(hub.current_load(), 1);
        // The rejected duplicate handle is closed; the original stays live.
        assert!(q2.is_closed());
        assert!(q2.recv().await.is_none());
        assert!(!q1.is_closed());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unregister_twice_closes_once() {
        let (hub, reporter) = spawn_hub();
        let (handle, mut queue) = session("bob", 4);
        let id = handle.id();
        hub.register(handle).await.unwrap();

        assert!(hub.unregister(id).await.unwrap());
        assert!(!hub.unregister(id).await.unwrap());

        assert!(queue.is_closed());
        assert!(queue.recv().await.is_none());
        assert_eq!(hub.current_load(), 0);
        assert_eq!(reporter.latest(), 0);
    }

    #[test_timeout::tokio_timeout_test(10, multi_thread)]
    async fn concurrent_unregister_removes_exactly_once() {
        let (hub, _) = spawn_hub();
        let (handle, queue) = session("carol", 4);
        let id = handle.id();
        hub.register(handle).await.unwrap();

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let hub = hub.clone();
                tokio::spawn(async move { hub.unregister(id).await.unwrap() })
            })
            .collect();
        let mut removed = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                removed += 1;
            }
        }

        assert_eq!(removed, 1);
        assert!(queue.is_closed());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn deliver_enqueues_once_per_session() {
        let (hub, _) = spawn_hub();
        let (a, mut qa) = session("a", 4);
        let (b, mut qb) = session("b", 4);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();

        let report = hub
            .deliver_local(Bytes::from_static(b"{\"content\":\"hi\"}"))
            .await
            .unwrap();

        assert_eq!(
            report,
            DeliveryReport {
                delivered: 2,
                evicted: 0
            }
        );
        assert_eq!(qa.recv().await.unwrap(), Bytes::from_static(b"{\"content\":\"hi\"}"));
        assert_eq!(qb.recv().await.unwrap(), Bytes::from_static(b"{\"content\":\"hi\"}"));
        assert!(qa.receiver.try_recv().is_err());
        assert!(qb.receiver.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn full_queue_evicts_only_the_slow_session() {
        let (hub, reporter) = spawn_hub();
        let (slow, mut slow_queue) = session("slow", 2);
        let (fast, mut fast_queue) = session("fast", 8);
        let slow_id = slow.id();
        hub.register(slow).await.unwrap();
        hub.register(fast).await.unwrap();

        for n in 0..2u8 {
            let report = hub.deliver_local(Bytes::from(vec![n])).await.unwrap();
            assert_eq!(report.evicted, 0);
        }
        let report = hub.deliver_local(Bytes::from_static(b"overflow")).await.unwrap();

        assert_eq!(
            report,
            DeliveryReport {
                delivered: 1,
                evicted: 1
            }
        );
        assert_eq!(hub.current_load(), 1);
        assert_eq!(reporter.latest(), 1);
        assert!(!hub.unregister(slow_id).await.unwrap());

        // Already-queued payloads still drain, then the queue reports closed.
        assert_eq!(slow_queue.recv().await.unwrap(), Bytes::from(vec![0u8]));
        assert_eq!(slow_queue.recv().await.unwrap(), Bytes::from(vec![1u8]));
        assert!(slow_queue.recv().await.is_none());
        assert!(slow_queue.is_closed());

        for expected in [&[0u8][..], &[1u8][..], &b"overflow"[..]] {
            assert_eq!(fast_queue.recv().await.unwrap(), Bytes::copy_from_slice(expected));
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn dropped_receiver_is_pruned_on_delivery() {
        let (hub, _) = spawn_hub();
        let (gone, queue) = session("gone", 4);
        hub.register(gone).await.unwrap();
        drop(queue);

        let report = hub.deliver_local(Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(report.evicted, 1);
        assert_eq!(hub.current_load(), 0);
    }

    #[test_timeout::tokio_timeout_test(20, multi_thread)]
    async fn concurrent_churn_leaves_consistent_registry() {
        let (hub, reporter) = spawn_hub();
        let mut tasks = Vec::new();
        for worker in 0..32usize {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, queue) = outbound_queue(Uuid::new_v4(), format!("u{worker}"), 4);
                let id = handle.id();
                hub.register(handle).await.unwrap();
                // Odd workers leave again, some of them twice.
                if worker % 2 == 1 {
                    hub.unregister(id).await.unwrap();
                    if worker % 3 == 0 {
                        hub.unregister(id).await.unwrap();
                    }
                    None
                } else {
                    Some((id, queue))
                }
            }));
        }

        let mut survivors = Vec::new();
        for task in tasks {
            if let Some(entry) = task.await.unwrap() {
                survivors.push(entry);
            }
        }

        let listed = hub.sessions().await.unwrap();
        assert_eq!(listed.len(), 16);
        assert_eq!(hub.current_load(), 16);
        assert_eq!(reporter.latest(), 16);
        for (id, queue) in &survivors {
            assert!(listed.iter().any(|s| s.id == *id));
            assert!(!queue.is_closed());
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stopped_hub_reports_error() {
        let reporter = Arc::new(WatchLoadReporter::new());
        let (hub, handle) = Hub::spawn("ws://test:1", reporter, HubConfig::default());
        handle.abort();
        let _ = handle.await;

        let (session, _queue) = session("late", 1);
        assert_eq!(hub.register(session).await, Err(HubError::Stopped));
    }
}
