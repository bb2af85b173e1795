use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{DEFAULT_ENDPOINT, HostOptions};
use crate::factory::{SessionBuilder, SessionFactory};
use crate::protocol::ServerMessage;
use crate::registration::SessionServicesExt;
use crate::registry::{ScopedBindings, ServiceRegistry};
use crate::scope::ScopeProvider;
use crate::session::{ConnectionHandle, Session};

const TEST_BASE_URI: &str = "http://localhost/";

/// Connection with its outbound receiver. Hold the receiver for the test's
/// lifetime or sends fail with `ConnectionClosed`.
pub fn test_connection() -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
    ConnectionHandle::new(
        uuid::Uuid::new_v4().to_string(),
        TEST_BASE_URI,
        TEST_BASE_URI,
        16,
    )
}

/// Build a `SessionFactory` from a registry with the baseline bindings.
/// `configure` runs before the baseline registration, so anything it binds
/// wins over the defaults.
pub fn test_factory(configure: impl FnOnce(&mut ServiceRegistry)) -> Arc<SessionFactory> {
    test_factory_with_options(HostOptions::default(), configure)
}

pub fn test_factory_with_options(
    options: HostOptions,
    configure: impl FnOnce(&mut ServiceRegistry),
) -> Arc<SessionFactory> {
    let mut registry = ServiceRegistry::new();
    registry.try_add_singleton(options);
    configure(&mut registry);
    registry.add_session_services();
    registry
        .build()
        .get::<SessionFactory>()
        .expect("session factory")
}

/// Create an active session on the default endpoint.
pub fn create_test_session(
    factory: &SessionFactory,
) -> (Arc<Session>, mpsc::Receiver<ServerMessage>) {
    create_session_at(factory, TEST_BASE_URI, TEST_BASE_URI)
}

pub fn create_session_at(
    factory: &SessionFactory,
    base_uri: &str,
    uri: &str,
) -> (Arc<Session>, mpsc::Receiver<ServerMessage>) {
    let (connection, rx) = ConnectionHandle::new("test", base_uri, uri, 16);
    let session = factory
        .create_session(DEFAULT_ENDPOINT, connection)
        .expect("create session");
    (session, rx)
}

/// A session and scope that are never dispatched: for exercising startup
/// callbacks directly, without a runtime.
pub struct ScratchScope {
    session: Arc<Session>,
    scope: Arc<ScopeProvider>,
    _outbound: mpsc::Receiver<ServerMessage>,
}

impl ScratchScope {
    pub fn new() -> Self {
        let (connection, outbound) = test_connection();
        let (commands, _) = mpsc::channel(1);
        let session = Arc::new(Session::new(DEFAULT_ENDPOINT, connection, commands));
        let scope = Arc::new(ScopeProvider::new(
            &session,
            Arc::new(HostOptions::default()),
            Arc::new(ScopedBindings::default()),
        ));
        Self {
            session,
            scope,
            _outbound: outbound,
        }
    }

    pub fn builder(&self) -> SessionBuilder<'_> {
        SessionBuilder::new(&self.session, &self.scope)
    }
}
