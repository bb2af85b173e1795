use crate::factory::SessionBuilder;
use crate::registry::ServiceRegistry;
use crate::scope::ScopeProvider;

/// Application startup for session hosting.
///
/// `configure_services` runs once, synchronously, while the process is being
/// configured. `configure` runs once for every new session on the endpoint
/// the startup is registered for, before the session serves any events.
///
/// ```no_run
/// use session_host::{ScopeProvider, ServiceRegistry, SessionBuilder, SessionServicesExt, Startup};
///
/// #[derive(Default)]
/// struct App;
///
/// impl Startup for App {
///     fn configure(&self, app: &mut SessionBuilder<'_>, _services: &ScopeProvider) -> anyhow::Result<()> {
///         app.add_component("counter", "#app");
///         Ok(())
///     }
/// }
///
/// let mut services = ServiceRegistry::new();
/// services.add_session_services_with::<App>().unwrap();
/// ```
pub trait Startup: Send + Sync + 'static {
    fn configure_services(&self, services: &mut ServiceRegistry) -> anyhow::Result<()> {
        let _ = services;
        Ok(())
    }

    fn configure(
        &self,
        app: &mut SessionBuilder<'_>,
        services: &ScopeProvider,
    ) -> anyhow::Result<()>;
}
