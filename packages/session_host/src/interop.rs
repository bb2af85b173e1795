//! Interop channel to the connected client.
//!
//! `InteropAccessor` sends `invoke` messages over the session's connection and
//! waits for the client's `invocation_result` with the same call id.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SessionError;
use crate::protocol::ServerMessage;
use crate::session::{ConnectionHandle, Session, SessionId};

/// Client's answer to an interop call: a result value or an error message
pub type InvocationOutcome = Result<Value, String>;

/// Outstanding calls for one session, keyed by call id
#[derive(Default)]
pub(crate) struct PendingCalls {
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, oneshot::Sender<InvocationOutcome>>>,
}

impl PendingCalls {
    fn register(&self) -> (u64, oneshot::Receiver<InvocationOutcome>) {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock().insert(call_id, tx);
        (call_id, rx)
    }

    pub(crate) fn complete(&self, call_id: u64, outcome: InvocationOutcome) -> bool {
        match self.lock().remove(&call_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    fn forget(&self, call_id: u64) {
        self.lock().remove(&call_id);
    }

    /// Drop every outstanding call; waiters observe a closed channel
    pub(crate) fn cancel_all(&self) {
        self.lock().clear();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<InvocationOutcome>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-session handle for invoking operations on the connected client.
pub struct InteropAccessor {
    session_id: SessionId,
    connection: ConnectionHandle,
    pending: Arc<PendingCalls>,
    shutdown: CancellationToken,
    timeout: Duration,
}

impl InteropAccessor {
    pub(crate) fn new(session: &Session, timeout: Duration) -> Self {
        Self {
            session_id: session.id(),
            connection: session.connection().clone(),
            pending: session.pending_calls(),
            shutdown: session.shutdown_token(),
            timeout,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn connection_id(&self) -> &str {
        self.connection.id()
    }

    /// Invoke `identifier` on the client and wait for its result.
    pub async fn invoke(&self, identifier: &str, args: Vec<Value>) -> Result<Value, SessionError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::SessionTerminated(self.session_id));
        }

        let (call_id, rx) = self.pending.register();
        debug!(session_id = %self.session_id, call_id, identifier, "Invoking client");
        let message = ServerMessage::Invoke {
            call_id,
            identifier: identifier.to_string(),
            args,
        };
        if let Err(e) = self.connection.send(message).await {
            self.pending.forget(call_id);
            return Err(e);
        }

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                Err(SessionError::SessionTerminated(self.session_id))
            }
            answer = rx => match answer {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(SessionError::InteropRejected {
                    identifier: identifier.to_string(),
                    message,
                }),
                Err(_) => Err(SessionError::SessionTerminated(self.session_id)),
            },
            _ = tokio::time::sleep(self.timeout) => Err(SessionError::InteropTimeout {
                identifier: identifier.to_string(),
                timeout: self.timeout,
            }),
        };
        self.pending.forget(call_id);
        outcome
    }

    /// Invoke and decode the result into `T`
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        identifier: &str,
        args: Vec<Value>,
    ) -> Result<T, SessionError> {
        let value = self.invoke(identifier, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Invoke and discard the result
    pub async fn invoke_void(&self, identifier: &str, args: Vec<Value>) -> Result<(), SessionError> {
        self.invoke(identifier, args).await.map(|_| ())
    }

    /// Calls still waiting on the client
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for InteropAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteropAccessor")
            .field("session_id", &self.session_id)
            .field("connection", &self.connection.id())
            .field("timeout", &self.timeout)
            .finish()
    }
}
