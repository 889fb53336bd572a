//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdfxError};

/// Backend address used when nothing is configured (ComfyUI default port).
pub const DEFAULT_HOST: &str = "http://127.0.0.1:8188";

/// Top-level sdfx-link configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Where the backend lives and how to authenticate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL; both endpoints are derived from it (`http` -> `ws`, `https` -> `wss`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Explicit REST endpoint, overrides the one derived from `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_endpoint: Option<String>,

    /// Explicit WebSocket endpoint, overrides the one derived from `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl ServerConfig {
    /// Resolve the bearer token: check `token` first, then `token_env`.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Fixed delay between reconnection attempts (default: 1000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,

    /// Attempts before giving up for good (default: 50).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_reconnect_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    50
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// File holding the resumption client id (default: `~/.sdfx_link/client_id`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "sdfx_link_client=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolved REST and WebSocket base URLs, without trailing slashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub http: String,
    pub ws: String,
}

impl Endpoints {
    pub fn new(http: impl Into<String>, ws: impl Into<String>) -> Self {
        Self {
            http: trim_slash(http.into()),
            ws: trim_slash(ws.into()),
        }
    }

    /// Derive both endpoints from a host URL, dropping any path.
    pub fn from_host(host: &str) -> Result<Self> {
        let (http_scheme, ws_scheme, rest) = if let Some(rest) = host.strip_prefix("http://") {
            ("http", "ws", rest)
        } else if let Some(rest) = host.strip_prefix("https://") {
            ("https", "wss", rest)
        } else {
            return Err(SdfxError::Config(format!(
                "Invalid host URL (expected http:// or https://): {host}"
            )));
        };

        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(SdfxError::Config(format!("Host URL has no host: {host}")));
        }

        Ok(Self {
            http: format!("{http_scheme}://{authority}"),
            ws: format!("{ws_scheme}://{authority}"),
        })
    }

    /// Streaming endpoint for a given client id.
    pub fn ws_url(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={client_id}", self.ws)
    }

    /// REST URL for a route such as `/queue`.
    pub fn http_url(&self, route: &str) -> String {
        if route.starts_with('/') {
            format!("{}{route}", self.http)
        } else {
            format!("{}/{route}", self.http)
        }
    }
}

fn trim_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| SdfxError::Other(e.into()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;

        json5::from_str(&substituted).map_err(|e| SdfxError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Resolve REST and WebSocket endpoints.
    pub fn endpoints(&self) -> Result<Endpoints> {
        let server = self.server.clone().unwrap_or_default();
        let host = server.host.as_deref().unwrap_or(DEFAULT_HOST);
        let derived = Endpoints::from_host(host)?;

        Ok(Endpoints::new(
            server.http_endpoint.unwrap_or(derived.http),
            server.ws_endpoint.unwrap_or(derived.ws),
        ))
    }

    /// Bearer token for both channels, if configured.
    pub fn auth_token(&self) -> Option<String> {
        self.server.as_ref().and_then(ServerConfig::resolve_token)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(
            self.reconnect
                .as_ref()
                .map_or_else(default_reconnect_delay_ms, |r| r.delay_ms),
        )
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.reconnect
            .as_ref()
            .map_or_else(default_max_attempts, |r| r.max_attempts)
    }

    /// File used to persist the resumption client id.
    pub fn identity_path(&self) -> PathBuf {
        self.identity
            .as_ref()
            .and_then(|i| i.path.as_ref())
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .unwrap_or_else(|| data_dir().join("client_id"))
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Get a config value by dotted path (e.g. "server.host", "reconnect.max_attempts").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Err(e) = self.endpoints() {
            errors.push(e.to_string());
        }

        if let Some(server) = &self.server {
            if let Some(env) = &server.token_env {
                if server.token.is_none() && server.resolve_token().is_none() {
                    warnings.push(format!("Token env var '{env}' is not set"));
                }
            }
            if let Some(ws) = &server.ws_endpoint {
                if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
                    errors.push(format!("ws_endpoint must start with ws:// or wss://: {ws}"));
                }
            }
            if let Some(http) = &server.http_endpoint {
                if !(http.starts_with("http://") || http.starts_with("https://")) {
                    errors.push(format!(
                        "http_endpoint must start with http:// or https://: {http}"
                    ));
                }
            }
        }

        if let Some(reconnect) = &self.reconnect {
            if reconnect.max_attempts == 0 {
                warnings.push("reconnect.max_attempts is 0; the client will never retry".into());
            }
            if reconnect.delay_ms == 0 {
                warnings.push("reconnect.delay_ms is 0; retries will spin".into());
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for sdfx-link data: `~/.sdfx_link/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sdfx_link")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SDFX_TOKEN", "tok-123") };
        let input = r#"{"token": "${TEST_SDFX_TOKEN}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("tok-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_SDFX_TOKEN") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_SDFX_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.max_reconnect_attempts(), 50);
        assert_eq!(
            config.endpoints().unwrap(),
            Endpoints::new("http://127.0.0.1:8188", "ws://127.0.0.1:8188")
        );
        assert!(config.auth_token().is_none());
    }

    #[test]
    fn test_endpoints_from_https_host() {
        let endpoints = Endpoints::from_host("https://gpu.example.com:8443/some/path").unwrap();
        assert_eq!(endpoints.http, "https://gpu.example.com:8443");
        assert_eq!(endpoints.ws, "wss://gpu.example.com:8443");
        assert_eq!(
            endpoints.ws_url("abc"),
            "wss://gpu.example.com:8443/ws?clientId=abc"
        );
    }

    #[test]
    fn test_endpoints_reject_bad_hosts() {
        assert!(Endpoints::from_host("ftp://example.com").is_err());
        assert!(Endpoints::from_host("example.com").is_err());
        assert!(Endpoints::from_host("http://").is_err());
    }

    #[test]
    fn test_explicit_endpoints_override_host() {
        let json = r#"{
            server: {
                host: "http://10.0.0.5:8188",
                ws_endpoint: "ws://10.0.0.6:9000/",
            }
        }"#;
        let config: Config = json5::from_str(json).unwrap();
        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints.http, "http://10.0.0.5:8188");
        assert_eq!(endpoints.ws, "ws://10.0.0.6:9000");
        assert_eq!(endpoints.http_url("/queue"), "http://10.0.0.5:8188/queue");
        assert_eq!(endpoints.http_url("prompt"), "http://10.0.0.5:8188/prompt");
    }

    #[test]
    fn test_token_resolution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SDFX_TOKEN_ENV", "from-env") };
        let server = ServerConfig {
            token_env: Some("TEST_SDFX_TOKEN_ENV".into()),
            ..ServerConfig::default()
        };
        assert_eq!(server.resolve_token(), Some("from-env".into()));

        let direct = ServerConfig {
            token: Some("direct".into()),
            token_env: Some("TEST_SDFX_TOKEN_ENV".into()),
            ..ServerConfig::default()
        };
        // Direct value takes priority
        assert_eq!(direct.resolve_token(), Some("direct".into()));
        unsafe { std::env::remove_var("TEST_SDFX_TOKEN_ENV") };
    }

    #[test]
    fn test_reconnect_defaults_when_section_is_empty() {
        let config: Config = json5::from_str(r#"{ reconnect: {} }"#).unwrap();
        assert_eq!(config.max_reconnect_attempts(), 50);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(1000));

        let config: Config = json5::from_str(r#"{ reconnect: { delay_ms: 250, max_attempts: 3 } }"#).unwrap();
        assert_eq!(config.max_reconnect_attempts(), 3);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging();
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_identity_path_override() {
        let config: Config = json5::from_str(r#"{ identity: { path: "/tmp/sdfx-id" } }"#).unwrap();
        assert_eq!(config.identity_path(), PathBuf::from("/tmp/sdfx-id"));
        assert!(Config::default().identity_path().ends_with("client_id"));
    }

    #[test]
    fn test_get_path() {
        let config: Config = json5::from_str(r#"{ server: { host: "http://h:1" } }"#).unwrap();
        assert_eq!(
            config.get_path("server.host"),
            Some(serde_json::json!("http://h:1"))
        );
        assert_eq!(config.get_path("server.nope"), None);
    }

    #[test]
    fn test_validate_bad_endpoints() {
        let config = Config {
            server: Some(ServerConfig {
                host: Some("localhost:8188".into()),
                ws_endpoint: Some("http://wrong".into()),
                ..ServerConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("Invalid host URL")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("ws_endpoint")), "{errors:?}");
    }

    #[test]
    fn test_validate_missing_token_env_warns() {
        let config = Config {
            server: Some(ServerConfig {
                token_env: Some("NONEXISTENT_SDFX_TOKEN_VAR".into()),
                ..ServerConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty(), "{errors:?}");
        assert!(warnings.iter().any(|w| w.contains("NONEXISTENT_SDFX_TOKEN_VAR")));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.server.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            reconnect: Some(ReconnectConfig {
                delay_ms: 500,
                max_attempts: 7,
            }),
            ..Config::default()
        };
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.max_reconnect_attempts(), 7);
    }
}
