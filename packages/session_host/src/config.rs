use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [hub]
//                    endpoint = "/app"
//
//   env var:         SESSION_HOST_HUB__ENDPOINT=/app   (double underscore = nesting)

/// Well-known endpoint that startup registrations bind to unless configured.
pub const DEFAULT_ENDPOINT: &str = "/_hub";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Session hub tunables (lives under `[hub]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_interop_timeout_secs")]
    pub interop_timeout_secs: u64,
    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            interop_timeout_secs: default_interop_timeout_secs(),
            dispatch_queue_capacity: default_dispatch_queue_capacity(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}
fn default_interop_timeout_secs() -> u64 {
    60
}
fn default_dispatch_queue_capacity() -> usize {
    64
}
fn default_outbound_capacity() -> usize {
    128
}

/// Build a figment that layers: defaults → config.toml → SESSION_HOST_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SESSION_HOST_HUB__ENDPOINT=/app`  →  `hub.endpoint = "/app"`
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("SESSION_HOST_").split("__"))
}

// =============================================================================
// Runtime option structs (registered into the ServiceRegistry as singletons)
// =============================================================================

/// Options consumed by session creation and startup registration.
#[derive(Clone, Debug)]
pub struct HostOptions {
    /// Endpoint identifier a startup registration binds to
    pub endpoint: String,
    /// How long an interop call waits for the client's result
    pub interop_timeout: Duration,
    /// Operations that may queue on one session's execution context
    pub dispatch_queue_capacity: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self::from_file(&HubFileConfig::default())
    }
}

impl HostOptions {
    pub fn from_file(fc: &HubFileConfig) -> Self {
        Self {
            endpoint: fc.endpoint.clone(),
            interop_timeout: Duration::from_secs(fc.interop_timeout_secs),
            dispatch_queue_capacity: fc.dispatch_queue_capacity.max(1),
        }
    }
}

/// Options consumed by the WebSocket hub.
#[derive(Clone, Debug)]
pub struct HubOptions {
    /// Channel capacity for messages to one client
    pub outbound_capacity: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self::from_file(&HubFileConfig::default())
    }
}

impl HubOptions {
    pub fn from_file(fc: &HubFileConfig) -> Self {
        Self {
            outbound_capacity: fc.outbound_capacity.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_file_config_defaults() {
        let d = HubFileConfig::default();
        assert_eq!(d.endpoint, "/_hub");
        assert_eq!(d.interop_timeout_secs, 60);
        assert_eq!(d.dispatch_queue_capacity, 64);
        assert_eq!(d.outbound_capacity, 128);
    }

    #[test]
    fn test_host_options_from_file() {
        let fc = HubFileConfig {
            endpoint: "/app".to_string(),
            interop_timeout_secs: 5,
            dispatch_queue_capacity: 0,
            ..Default::default()
        };
        let opts = HostOptions::from_file(&fc);
        assert_eq!(opts.endpoint, "/app");
        assert_eq!(opts.interop_timeout, Duration::from_secs(5));
        // zero would make the dispatch channel panic
        assert_eq!(opts.dispatch_queue_capacity, 1);
    }

    #[test]
    fn test_load_config_defaults() {
        let fc: FileConfig = load_config(None).extract().unwrap();
        assert_eq!(fc.hub.endpoint, DEFAULT_ENDPOINT);
        assert!(fc.server.host.is_none());
        assert!(fc.server.port.is_none());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 8080\n\n[hub]\nendpoint = \"/app\"\ninterop_timeout_secs = 10\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.server.port, Some(8080));
        assert_eq!(fc.hub.endpoint, "/app");
        assert_eq!(fc.hub.interop_timeout_secs, 10);
        assert_eq!(fc.hub.outbound_capacity, 128);
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(Some(&tmp.path().join("absent.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc.hub.endpoint, DEFAULT_ENDPOINT);
    }
}
