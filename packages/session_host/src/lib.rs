//! Server-held interactive sessions for clients on a persistent WebSocket.
//!
//! Each connection gets a [`Session`] with its own [`ScopeProvider`]. An
//! application binds a [`Startup`] to an endpoint once, at process
//! configuration time, and its `configure` runs once for every new session
//! on that endpoint before the session serves any event.

pub mod config;
mod dispatch;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod hub;
pub mod interop;
pub mod navigation;
pub mod protocol;
pub mod registration;
pub mod registry;
pub mod scope;
pub mod session;
pub mod startup;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{DEFAULT_ENDPOINT, FileConfig, HostOptions, HubOptions, load_config};
pub use endpoint::{ConfigureCallback, EndpointStartupTable};
pub use error::{ErrorResponse, SessionError};
pub use factory::{SessionBuilder, SessionFactory};
pub use hub::SessionHub;
pub use interop::{InteropAccessor, InvocationOutcome};
pub use navigation::NavigationHelper;
pub use protocol::{ClientMessage, RootComponent, ServerMessage};
pub use registration::SessionServicesExt;
pub use registry::{BindingKey, Lifetime, ServiceProvider, ServiceRegistry};
pub use scope::ScopeProvider;
pub use session::{ConnectionHandle, EventHandler, Session, SessionId, SessionState};
pub use startup::Startup;
