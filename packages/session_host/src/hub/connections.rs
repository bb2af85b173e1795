use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::factory::SessionFactory;
use crate::navigation;
use crate::session::{ConnectionHandle, Session, SessionId};

/// Live sessions keyed by id.
///
/// The hub is the transport's view of the session lifecycle: `on_connect`
/// creates a session through the [`SessionFactory`], `on_disconnect`
/// terminates it.
pub struct SessionHub {
    factory: Arc<SessionFactory>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionHub {
    pub fn new(factory: Arc<SessionFactory>) -> Self {
        Self {
            factory,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    /// Create a session for a new connection on `endpoint`.
    ///
    /// A connection whose URIs cannot be parsed is rejected before any
    /// session exists. A failed configuration leaves nothing tracked.
    pub async fn on_connect(
        &self,
        endpoint: &str,
        connection: ConnectionHandle,
    ) -> Result<Arc<Session>, SessionError> {
        if let Err(e) = navigation::resolve_location(connection.base_uri(), connection.uri()) {
            warn!(connection = %connection.id(), endpoint = %endpoint, "Rejected connection: {e}");
            connection.close();
            return Err(e);
        }

        let session = self.factory.create_session(endpoint, connection)?;
        self.sessions
            .write()
            .await
            .insert(session.id(), session.clone());
        Ok(session)
    }

    /// Terminate and forget the session. Unknown ids are ignored.
    pub async fn on_disconnect(&self, id: SessionId) {
        let removed = self.sessions.write().await.remove(&id);
        if let Some(session) = removed {
            session.terminate().await;
        }
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Terminate every live session.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        if drained.is_empty() {
            return;
        }
        info!(sessions = drained.len(), "Terminating live sessions");
        for session in drained {
            session.terminate().await;
        }
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}
