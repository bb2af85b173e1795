//! Registration entry points for session hosting.
//!
//! Applications call one of the [`SessionServicesExt`] methods on their
//! [`ServiceRegistry`] once while configuring the process:
//!
//! - `add_session_services` installs the baseline bindings only.
//! - `add_session_services_with::<S>()` and `add_session_services_with_startup`
//!   additionally run the startup's `configure_services` and bind its
//!   `configure` to the configured endpoint.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{DEFAULT_ENDPOINT, HostOptions};
use crate::endpoint::ConfigureCallback;
use crate::error::SessionError;
use crate::factory::{SessionBuilder, SessionFactory};
use crate::hub;
use crate::interop::InteropAccessor;
use crate::navigation::NavigationHelper;
use crate::registry::ServiceRegistry;
use crate::session::Session;
use crate::startup::Startup;

pub trait SessionServicesExt {
    /// Install the baseline process-wide and per-session bindings.
    ///
    /// Every binding is added only if absent, so calling this again is a
    /// no-op.
    fn add_session_services(&mut self) -> &mut Self;

    /// Baseline registration plus a default-constructed startup `S`.
    fn add_session_services_with<S: Startup + Default>(&mut self) -> Result<&mut Self, SessionError>;

    /// Baseline registration plus `startup`.
    ///
    /// Fails with [`SessionError::InvalidOperation`] wrapping
    /// [`SessionError::DuplicateEndpoint`] when a startup is already bound to
    /// the endpoint.
    fn add_session_services_with_startup<S: Startup>(
        &mut self,
        startup: S,
    ) -> Result<&mut Self, SessionError>;
}

impl SessionServicesExt for ServiceRegistry {
    fn add_session_services(&mut self) -> &mut Self {
        let before = self.len();

        self.try_add_singleton(HostOptions::default());
        self.try_add_singleton_with(SessionFactory::from_provider);

        self.try_add_scoped::<Session, _>(|scope| scope.session());
        self.try_add_scoped::<InteropAccessor, _>(|scope| {
            Ok(Arc::new(InteropAccessor::new(
                &*scope.session()?,
                scope.options().interop_timeout,
            )))
        });
        self.try_add_scoped::<NavigationHelper, _>(|scope| {
            let interop = scope.interop()?;
            Ok(Arc::new(NavigationHelper::new(
                scope.session()?.connection(),
                interop,
            )?))
        });

        hub::add_hub_services(self);

        debug!(added = self.len() - before, "Registered session services");
        self
    }

    fn add_session_services_with<S: Startup + Default>(&mut self) -> Result<&mut Self, SessionError> {
        self.add_session_services_with_startup(S::default())
    }

    fn add_session_services_with_startup<S: Startup>(
        &mut self,
        startup: S,
    ) -> Result<&mut Self, SessionError> {
        self.add_session_services();

        startup
            .configure_services(self)
            .map_err(SessionError::Startup)?;

        let endpoint = self
            .singleton::<HostOptions>()
            .map(|options| options.endpoint.clone())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let startup = Arc::new(startup);
        let callback: ConfigureCallback = Arc::new(move |app: &mut SessionBuilder<'_>| {
            let services = app.services();
            startup.configure(app, services)
        });

        self.endpoints_mut()
            .register(endpoint.clone(), callback)
            .map_err(|e| match e {
                SessionError::DuplicateEndpoint { .. } => SessionError::invalid_operation(e),
                other => other,
            })?;

        info!(
            endpoint = %endpoint,
            startup = std::any::type_name::<S>(),
            "Startup bound to endpoint"
        );
        Ok(self)
    }
}
