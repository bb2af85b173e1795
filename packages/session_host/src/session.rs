use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::{self, SessionCommand};
use crate::error::SessionError;
use crate::interop::{InvocationOutcome, PendingCalls};
use crate::protocol::{RootComponent, ServerMessage};
use crate::scope::ScopeProvider;

/// Unique identifier for a session
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a session. `Terminated` is absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Configuring = 1,
    Active = 2,
    Terminated = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Configuring,
            2 => Self::Active,
            _ => Self::Terminated,
        }
    }
}

/// Transport-level connection a session is bound to.
///
/// Outgoing messages are queued on a bounded channel drained by the transport;
/// closing the handle tells the transport to drop the physical connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: String,
    base_uri: String,
    uri: String,
    outbound: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: impl Into<String>,
        base_uri: impl Into<String>,
        uri: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: id.into(),
            base_uri: base_uri.into(),
            uri: uri.into(),
            outbound,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base URI the client application is served from
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// URI the client was at when it connected
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub async fn send(&self, message: ServerMessage) -> Result<(), SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::ConnectionClosed);
        }
        tokio::select! {
            result = self.outbound.send(message) => {
                result.map_err(|_| SessionError::ConnectionClosed)
            }
            _ = self.closed.cancelled() => Err(SessionError::ConnectionClosed),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// Token cancelled when the connection should be dropped
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Handler for a named client UI event, run on the session's execution context.
pub type EventHandler =
    Arc<dyn Fn(Arc<ScopeProvider>, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Server-held state for one client connection.
pub struct Session {
    id: SessionId,
    endpoint: String,
    connection: ConnectionHandle,
    created_at: DateTime<Utc>,
    state: AtomicU8,
    terminated: AtomicBool,
    shutdown: CancellationToken,
    commands: mpsc::Sender<SessionCommand>,
    pending: Arc<PendingCalls>,
    components: OnceLock<Vec<RootComponent>>,
    handlers: OnceLock<HashMap<String, EventHandler>>,
}

impl Session {
    pub(crate) fn new(
        endpoint: &str,
        connection: ConnectionHandle,
        commands: mpsc::Sender<SessionCommand>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            endpoint: endpoint.to_string(),
            connection,
            created_at: Utc::now(),
            state: AtomicU8::new(SessionState::Created as u8),
            terminated: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            commands,
            pending: Arc::new(PendingCalls::default()),
            components: OnceLock::new(),
            handlers: OnceLock::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Root components registered while the session was configuring
    pub fn root_components(&self) -> &[RootComponent] {
        self.components.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.handlers
            .get()
            .is_some_and(|handlers| handlers.contains_key(name))
    }

    /// Move to `next` unless the session already terminated.
    pub(crate) fn set_state(&self, next: SessionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SessionState::Terminated as u8).then_some(next as u8)
            })
            .is_ok()
    }

    pub(crate) fn install(
        &self,
        components: Vec<RootComponent>,
        handlers: HashMap<String, EventHandler>,
    ) {
        let _ = self.components.set(components);
        let _ = self.handlers.set(handlers);
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn pending_calls(&self) -> Arc<PendingCalls> {
        self.pending.clone()
    }

    /// Deliver the client's answer to an outstanding interop call.
    pub fn complete_invocation(&self, call_id: u64, outcome: InvocationOutcome) -> bool {
        self.pending.complete(call_id, outcome)
    }

    /// Run `op` on this session's execution context and wait for its result.
    ///
    /// Operations run one at a time in submission order.
    pub async fn run<F, Fut, T>(&self, op: F) -> Result<T, SessionError>
    where
        F: FnOnce(Arc<ScopeProvider>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SessionError>> + Send + 'static,
        T: Send + 'static,
    {
        let rx = self.enqueue(op).await?;
        rx.await
            .map_err(|_| SessionError::SessionTerminated(self.id))?
    }

    /// Queue `op`, waiting for room on the execution context's queue; the
    /// receiver yields its result.
    pub async fn enqueue<F, Fut, T>(
        &self,
        op: F,
    ) -> Result<oneshot::Receiver<Result<T, SessionError>>, SessionError>
    where
        F: FnOnce(Arc<ScopeProvider>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SessionError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_terminated() {
            return Err(SessionError::SessionTerminated(self.id));
        }
        let (job, rx) = dispatch::job(op);
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SessionError::SessionTerminated(self.id)),
            sent = self.commands.send(SessionCommand::Run(job)) => {
                sent.map_err(|_| SessionError::SessionTerminated(self.id))?;
                Ok(rx)
            }
        }
    }

    /// Queue `op` only if the queue has room; fails with
    /// [`SessionError::DispatchQueueFull`] instead of waiting.
    pub fn submit<F, Fut, T>(
        &self,
        op: F,
    ) -> Result<oneshot::Receiver<Result<T, SessionError>>, SessionError>
    where
        F: FnOnce(Arc<ScopeProvider>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SessionError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_terminated() {
            return Err(SessionError::SessionTerminated(self.id));
        }
        let (job, rx) = dispatch::job(op);
        self.commands
            .try_send(SessionCommand::Run(job))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::DispatchQueueFull(self.id),
                mpsc::error::TrySendError::Closed(_) => SessionError::SessionTerminated(self.id),
            })?;
        Ok(rx)
    }

    /// Queue the handler registered for `name` with the event payload,
    /// waiting for room on the queue.
    pub async fn dispatch_event(
        &self,
        name: &str,
        payload: Value,
    ) -> Result<oneshot::Receiver<Result<(), SessionError>>, SessionError> {
        let handler = self
            .handlers
            .get()
            .and_then(|handlers| handlers.get(name))
            .cloned()
            .ok_or_else(|| SessionError::UnknownEvent(name.to_string()))?;
        let name = name.to_string();
        debug!(session_id = %self.id, event = %name, "Dispatching event");
        self.enqueue(move |scope| async move {
            handler(scope, payload)
                .await
                .map_err(|source| SessionError::EventHandler { name, source })
        })
        .await
    }

    /// Terminate the session and wait until its scope has been disposed.
    ///
    /// An operation already running finishes first (in-flight interop calls
    /// fail with `SessionTerminated`); queued operations are dropped.
    /// Must not be awaited from inside an operation on this session; use
    /// [`Session::abort`] there.
    pub async fn terminate(&self) {
        if self.begin_termination() {
            self.enqueue_terminate();
        }
        self.commands.closed().await;
    }

    /// Terminate without waiting for the execution context to wind down.
    pub fn abort(&self) {
        if self.begin_termination() {
            self.enqueue_terminate();
        }
    }

    fn begin_termination(&self) -> bool {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state
            .store(SessionState::Terminated as u8, Ordering::Release);
        self.shutdown.cancel();
        self.pending.cancel_all();
        self.connection.close();
        info!(session_id = %self.id, endpoint = %self.endpoint, "Session terminated");
        true
    }

    fn enqueue_terminate(&self) {
        match self.commands.try_send(SessionCommand::Terminate) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => match Handle::try_current() {
                Ok(runtime) => {
                    let commands = self.commands.clone();
                    runtime.spawn(async move {
                        let _ = commands.send(cmd).await;
                    });
                }
                // No runtime means no dispatcher can be draining the queue.
                Err(_) => debug!(session_id = %self.id, "No runtime to queue termination on"),
            },
        }
    }
}

impl Drop for Session {
    // The command sender goes with the session, so its dispatcher stops after
    // the running operation and queued operations are dropped.
    fn drop(&mut self) {
        self.begin_termination();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("connection", &self.connection.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostOptions;
    use crate::test_helpers::{create_test_session, test_factory, test_factory_with_options};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn session_state_roundtrip_u8() {
        for state in [
            SessionState::Created,
            SessionState::Configuring,
            SessionState::Active,
            SessionState::Terminated,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }

    #[tokio::test]
    async fn connection_send_after_close_fails() {
        let (conn, mut rx) = ConnectionHandle::new("c1", "http://h/", "http://h/", 4);
        conn.send(ServerMessage::Invoke {
            call_id: 1,
            identifier: "x".to_string(),
            args: vec![],
        })
        .await
        .unwrap();
        assert!(rx.recv().await.is_some());

        conn.close();
        assert!(conn.is_closed());
        let err = conn
            .send(ServerMessage::Invoke {
                call_id: 2,
                identifier: "x".to_string(),
                args: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ConnectionClosed));
    }

    #[tokio::test]
    async fn run_returns_operation_result() {
        let (session, _rx) = create_test_session(&test_factory(|_| {}));
        let id = session.id();
        let value = session
            .run(move |scope| async move { Ok(scope.session()?.id() == id) })
            .await
            .unwrap();
        assert!(value);
        session.terminate().await;
    }

    #[tokio::test]
    async fn operations_never_overlap() {
        let (session, _rx) = create_test_session(&test_factory(|_| {}));
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut waits = Vec::new();
        for _ in 0..8 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            let rx = session
                .submit(move |_scope| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            waits.push(rx);
        }
        for rx in waits {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        session.terminate().await;
    }

    #[tokio::test]
    async fn operations_run_in_submission_order() {
        let (session, _rx) = create_test_session(&test_factory(|_| {}));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut waits = Vec::new();
        for i in 0..5 {
            let order = order.clone();
            waits.push(
                session
                    .submit(move |_scope| async move {
                        order.lock().unwrap().push(i);
                        Ok(())
                    })
                    .unwrap(),
            );
        }
        for rx in waits {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        session.terminate().await;
    }

    #[tokio::test]
    async fn terminate_waits_for_in_flight_operation() {
        let (session, _rx) = create_test_session(&test_factory(|_| {}));
        let (started_tx, started_rx) = oneshot::channel();
        let in_flight = session
            .submit(move |scope| async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(30)).await;
                // scope singletons stay usable until the operation returns
                scope.interop().map(|_| ())
            })
            .unwrap();
        let queued = session.submit(|_scope| async { Ok(()) }).unwrap();

        started_rx.await.unwrap();
        session.terminate().await;

        assert!(in_flight.await.unwrap().is_ok());
        assert!(queued.await.is_err(), "queued operation must be dropped");
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_absorbing() {
        let (session, _rx) = create_test_session(&test_factory(|_| {}));
        assert_eq!(session.state(), SessionState::Active);
        session.terminate().await;
        session.terminate().await;
        assert!(session.is_terminated());
        assert!(!session.set_state(SessionState::Active));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.connection().is_closed());
    }

    #[tokio::test]
    async fn run_after_terminate_fails() {
        let (session, _rx) = create_test_session(&test_factory(|_| {}));
        session.terminate().await;
        let err = session.run(|_scope| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionTerminated(id) if id == session.id()));
        let err = session.submit(|_scope| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, SessionError::SessionTerminated(_)));
    }

    #[tokio::test]
    async fn unknown_event_is_rejected() {
        let (session, _rx) = create_test_session(&test_factory(|_| {}));
        let err = session.dispatch_event("nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownEvent(name) if name == "nope"));
        session.terminate().await;
    }

    #[tokio::test]
    async fn enqueue_waits_for_room_instead_of_dropping() {
        let options = HostOptions {
            dispatch_queue_capacity: 1,
            ..HostOptions::default()
        };
        let (session, _rx) = create_test_session(&test_factory_with_options(options, |_| {}));

        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = session
            .submit(move |_scope| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();
        started_rx.await.unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let producer = tokio::spawn({
            let session = session.clone();
            let order = order.clone();
            async move {
                let mut waits = Vec::new();
                for i in 0..6 {
                    let order = order.clone();
                    let rx = session
                        .enqueue(move |_scope| async move {
                            order.lock().unwrap().push(i);
                            Ok(())
                        })
                        .await
                        .unwrap();
                    waits.push(rx);
                }
                waits
            }
        });

        // the single slot fills while the blocker runs
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert!(matches!(
            session.submit(|_scope| async { Ok(()) }),
            Err(SessionError::DispatchQueueFull(_))
        ));

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        let waits = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        for rx in waits {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        session.terminate().await;
    }

    #[tokio::test]
    async fn enqueue_blocked_on_full_queue_fails_when_terminated() {
        let options = HostOptions {
            dispatch_queue_capacity: 1,
            ..HostOptions::default()
        };
        let (session, _rx) = create_test_session(&test_factory_with_options(options, |_| {}));
        let (started_tx, started_rx) = oneshot::channel();
        let _blocker = session
            .submit(move |_scope| async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .unwrap();
        started_rx.await.unwrap();
        let _queued = session.submit(|_scope| async { Ok(()) }).unwrap();

        let waiting = tokio::spawn({
            let session = session.clone();
            async move { session.enqueue(|_scope| async { Ok(()) }).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.abort();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::SessionTerminated(_)));
        session.terminate().await;
    }

    #[tokio::test]
    async fn dropped_session_drops_queued_operations() {
        let (session, _rx) = create_test_session(&test_factory(|_| {}));
        let (started_tx, started_rx) = oneshot::channel();
        let in_flight = session
            .submit(move |_scope| async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            })
            .unwrap();
        let queued = session.submit(|_scope| async { Ok(()) }).unwrap();
        started_rx.await.unwrap();
        drop(session);

        assert!(in_flight.await.unwrap().is_ok());
        assert!(queued.await.is_err());
    }
}
