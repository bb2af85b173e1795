use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SessionError;
use crate::factory::SessionBuilder;

/// Configuration routine run once for every new session on an endpoint.
pub type ConfigureCallback =
    Arc<dyn Fn(&mut SessionBuilder<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Maps endpoint identifiers to their startup configuration.
///
/// Populated during process configuration only; each endpoint is bound at
/// most once and bindings are never removed.
#[derive(Clone, Default)]
pub struct EndpointStartupTable {
    callbacks: HashMap<String, ConfigureCallback>,
}

impl EndpointStartupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        endpoint: impl Into<String>,
        callback: ConfigureCallback,
    ) -> Result<(), SessionError> {
        let endpoint = endpoint.into();
        validate_endpoint(&endpoint)?;
        if self.callbacks.contains_key(&endpoint) {
            return Err(SessionError::DuplicateEndpoint { endpoint });
        }
        self.callbacks.insert(endpoint, callback);
        Ok(())
    }

    /// Bind a closure; see [`EndpointStartupTable::register`]
    pub fn register_fn<F>(&mut self, endpoint: impl Into<String>, f: F) -> Result<(), SessionError>
    where
        F: Fn(&mut SessionBuilder<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(endpoint, Arc::new(f))
    }

    /// The callback bound to `endpoint`; `None` means sessions skip configuration
    pub fn lookup(&self, endpoint: &str) -> Option<ConfigureCallback> {
        self.callbacks.get(endpoint).cloned()
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.callbacks.contains_key(endpoint)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.callbacks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

pub(crate) fn validate_endpoint(endpoint: &str) -> Result<(), SessionError> {
    if !endpoint.starts_with('/') {
        return Err(SessionError::InvalidArgument(format!(
            "endpoint '{endpoint}' must be an absolute path starting with '/'"
        )));
    }
    Ok(())
}
