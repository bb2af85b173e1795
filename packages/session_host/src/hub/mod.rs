//! WebSocket Session Hub
//!
//! Transport for sessions: one WebSocket per client on each bound endpoint.
//! - Creates a session when a client connects and tears it down on disconnect
//! - Carries interop calls, UI events and location changes as JSON text frames

mod connections;
mod handler;

pub use connections::SessionHub;
pub use handler::{ConnectQuery, router};

use crate::config::HubOptions;
use crate::factory::SessionFactory;
use crate::registry::ServiceRegistry;

/// Register the hub's own bindings. Add-if-absent, like every baseline binding.
pub(crate) fn add_hub_services(registry: &mut ServiceRegistry) {
    registry.try_add_singleton(HubOptions::default());
    registry.try_add_singleton_with(|provider| {
        Ok(SessionHub::new(provider.get::<SessionFactory>()?))
    });
}
