use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::error::SessionError;
use crate::interop::InteropAccessor;
use crate::session::ConnectionHandle;

/// Client-side operation that changes the browser location
pub const NAVIGATE_TO: &str = "navigation.navigateTo";

/// Per-session view of the client's location.
///
/// Built from the base and current URI the client reported when it
/// connected. The current URI follows the client's `location_changed`
/// messages.
pub struct NavigationHelper {
    base_uri: Url,
    location: watch::Sender<String>,
    interop: Arc<InteropAccessor>,
}

impl NavigationHelper {
    pub(crate) fn new(
        connection: &ConnectionHandle,
        interop: Arc<InteropAccessor>,
    ) -> Result<Self, SessionError> {
        let (base_uri, current) = resolve_location(connection.base_uri(), connection.uri())?;
        let (location, _) = watch::channel(current.to_string());
        Ok(Self {
            base_uri,
            location,
            interop,
        })
    }

    /// Base URI, always ending in `/`
    pub fn base_uri(&self) -> &str {
        self.base_uri.as_str()
    }

    /// Absolute URI the client is currently at
    pub fn uri(&self) -> String {
        self.location.borrow().clone()
    }

    /// Resolve `relative` against the base URI
    pub fn to_absolute(&self, relative: &str) -> Result<String, SessionError> {
        self.base_uri
            .join(relative)
            .map(String::from)
            .map_err(|e| SessionError::InvalidArgument(format!("invalid uri '{relative}': {e}")))
    }

    /// Path of `uri` relative to the base URI, `None` when `uri` is outside it.
    ///
    /// The base URI without its trailing slash maps to the empty path.
    pub fn to_base_relative_path(&self, uri: &str) -> Option<String> {
        let base = self.base_uri.as_str();
        if let Some(rest) = uri.strip_prefix(base) {
            return Some(rest.to_string());
        }
        (uri == &base[..base.len() - 1]).then(String::new)
    }

    /// Watch the current URI
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.location.subscribe()
    }

    /// Record a location change reported by the client.
    pub fn notify_location_changed(&self, uri: &str) -> Result<(), SessionError> {
        let absolute = self.to_absolute(uri)?;
        debug!(session_id = %self.interop.session_id(), uri = %absolute, "Location changed");
        self.location.send_replace(absolute);
        Ok(())
    }

    /// Ask the client to navigate to `uri`.
    ///
    /// With `force_load` the client bypasses client-side routing and reloads
    /// the page from the server.
    pub async fn navigate_to(&self, uri: &str, force_load: bool) -> Result<(), SessionError> {
        let absolute = self.to_absolute(uri)?;
        self.interop
            .invoke_void(NAVIGATE_TO, vec![json!(absolute), json!(force_load)])
            .await
    }
}

/// Parse a connection's base URI and resolve its current URI against it.
pub(crate) fn resolve_location(base_uri: &str, uri: &str) -> Result<(Url, Url), SessionError> {
    let base = parse_base(base_uri)?;
    let current = base
        .join(uri)
        .map_err(|e| SessionError::InvalidArgument(format!("invalid uri '{uri}': {e}")))?;
    Ok((base, current))
}

fn parse_base(raw: &str) -> Result<Url, SessionError> {
    let mut base = Url::parse(raw)
        .map_err(|e| SessionError::InvalidArgument(format!("invalid base uri '{raw}': {e}")))?;
    if base.cannot_be_a_base() {
        return Err(SessionError::InvalidArgument(format!(
            "base uri '{raw}' cannot be a base"
        )));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.set_query(None);
    base.set_fragment(None);
    Ok(base)
}

impl std::fmt::Debug for NavigationHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationHelper")
            .field("base_uri", &self.base_uri.as_str())
            .field("uri", &*self.location.borrow())
            .finish()
    }
}
