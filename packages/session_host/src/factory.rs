//! Session creation.
//!
//! [`SessionFactory::create_session`] builds a [`Session`] and its
//! [`ScopeProvider`], runs the startup callback bound to the session's
//! endpoint with a [`SessionBuilder`], and only then starts the session's
//! dispatcher. Nothing else can reach the session while it configures.

use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HostOptions;
use crate::dispatch::SessionDispatcher;
use crate::endpoint::EndpointStartupTable;
use crate::error::SessionError;
use crate::protocol::RootComponent;
use crate::registry::{ScopedBindings, ServiceProvider};
use crate::scope::ScopeProvider;
use crate::session::{ConnectionHandle, EventHandler, Session, SessionState};

/// Session-scoped builder handed to an endpoint's startup callback.
pub struct SessionBuilder<'a> {
    session: &'a Arc<Session>,
    scope: &'a Arc<ScopeProvider>,
    components: Vec<RootComponent>,
    handlers: HashMap<String, EventHandler>,
}

impl<'a> SessionBuilder<'a> {
    pub(crate) fn new(session: &'a Arc<Session>, scope: &'a Arc<ScopeProvider>) -> Self {
        Self {
            session,
            scope,
            components: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// The session being configured
    pub fn session(&self) -> &'a Arc<Session> {
        self.session
    }

    /// The session's resolution scope
    pub fn services(&self) -> &'a Arc<ScopeProvider> {
        self.scope
    }

    /// Attach `component` to the client element matching `selector`.
    pub fn add_component(
        &mut self,
        component: impl Into<String>,
        selector: impl Into<String>,
    ) -> &mut Self {
        self.components.push(RootComponent {
            component: component.into(),
            selector: selector.into(),
        });
        self
    }

    /// Handle the client UI event `name`.
    ///
    /// The handler runs on the session's execution context. An error it
    /// returns terminates the session. Registering a name twice replaces the
    /// earlier handler.
    pub fn on_event<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Arc<ScopeProvider>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handler: EventHandler = Arc::new(move |scope, payload| handler(scope, payload).boxed());
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(session_id = %self.session.id(), event = %name, "Replaced event handler");
        }
        self
    }

    pub fn components(&self) -> &[RootComponent] {
        &self.components
    }

    pub(crate) fn finish(self) -> (Vec<RootComponent>, HashMap<String, EventHandler>) {
        (self.components, self.handlers)
    }
}

/// Creates sessions for incoming connections. Registered as a process-wide
/// singleton by the baseline registration.
pub struct SessionFactory {
    endpoints: Arc<EndpointStartupTable>,
    scoped: Arc<ScopedBindings>,
    options: Arc<HostOptions>,
}

impl SessionFactory {
    pub fn from_provider(provider: &ServiceProvider) -> Result<Self, SessionError> {
        Ok(Self {
            endpoints: provider.endpoints().clone(),
            scoped: provider.scoped_bindings().clone(),
            options: provider.get::<HostOptions>()?,
        })
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    pub fn endpoints(&self) -> &EndpointStartupTable {
        &self.endpoints
    }

    /// Create and configure a session for `connection` on `endpoint`.
    ///
    /// When a startup callback is bound to `endpoint` it runs exactly once,
    /// before the session serves any operation. If it fails the scope is
    /// disposed, the connection is closed and the session never becomes
    /// active.
    ///
    /// The session's dispatcher is spawned on the current Tokio runtime;
    /// without one this fails with [`SessionError::RuntimeUnavailable`].
    /// Dropping the last handle to the session terminates it.
    pub fn create_session(
        &self,
        endpoint: &str,
        connection: ConnectionHandle,
    ) -> Result<Arc<Session>, SessionError> {
        let runtime = Handle::try_current().map_err(|_| SessionError::RuntimeUnavailable)?;
        let (commands, receiver) = mpsc::channel(self.options.dispatch_queue_capacity.max(1));
        let session = Arc::new(Session::new(endpoint, connection, commands));
        let scope = Arc::new(ScopeProvider::new(
            &session,
            self.options.clone(),
            self.scoped.clone(),
        ));

        let (components, handlers) = match self.endpoints.lookup(endpoint) {
            Some(callback) => {
                session.set_state(SessionState::Configuring);
                let mut builder = SessionBuilder::new(&session, &scope);
                if let Err(source) = callback(&mut builder) {
                    warn!(
                        session_id = %session.id(),
                        endpoint = %endpoint,
                        "Session configuration failed: {source:#}"
                    );
                    scope.dispose();
                    session.abort();
                    return Err(SessionError::SessionConfiguration {
                        session_id: session.id(),
                        endpoint: endpoint.to_string(),
                        source,
                    });
                }
                builder.finish()
            }
            None => {
                debug!(endpoint = %endpoint, "No startup bound to endpoint");
                (Vec::new(), HashMap::new())
            }
        };

        session.install(components, handlers);
        session.set_state(SessionState::Active);
        info!(
            session_id = %session.id(),
            endpoint = %endpoint,
            connection = %session.connection().id(),
            "Session created"
        );
        SessionDispatcher::spawn(&runtime, scope, receiver);
        Ok(session)
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("endpoints", &self.endpoints.endpoints().collect::<Vec<_>>())
            .field("options", &self.options)
            .finish()
    }
}
