//! Environment-driven configuration for the gateway, following the same
//! `config`-crate-plus-env-overrides shape as `noa_server_core::config`.

use std::collections::HashMap;
use std::path::PathBuf;

use config::{Config, ConfigError as BuilderError, Environment};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Builder(#[from] BuilderError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub auth_enabled: bool,
    #[serde(default = "default_cookie_name")]
    pub session_cookie_name: String,
    #[serde(default = "default_session_lifetime_secs")]
    pub session_lifetime_secs: i64,
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
    #[serde(default)]
    pub initial_secret_file: Option<PathBuf>,

    #[serde(default)]
    pub oidc: OidcSettings,

    #[serde(default = "default_true")]
    pub agent_enabled: bool,
    #[serde(default)]
    pub agent_psk_hex: Option<String>,
    #[serde(default = "default_true")]
    pub agent_auto_enroll: bool,
    #[serde(default = "default_agent_window_secs")]
    pub agent_timestamp_window_secs: i64,
    #[serde(default)]
    pub agent_require_host_match: bool,

    #[serde(default = "default_rate_limit_rate")]
    pub rate_limit_refill_per_sec: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OidcSettings {
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    #[serde(default = "default_oidc_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub group_mapping_json: Option<String>,
    #[serde(default = "default_role_viewer")]
    pub default_role: String,
    #[serde(default = "default_true")]
    pub auto_provision: bool,
}

impl OidcSettings {
    /// Parse the `group -> team` mapping carried as a JSON object string,
    /// since the `config` crate's environment source has no native map
    /// syntax. An absent or malformed value yields an empty mapping rather
    /// than failing configuration load.
    pub fn group_mapping(&self) -> HashMap<String, String> {
        self.group_mapping_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

fn default_cookie_name() -> String {
    "avika_session".into()
}

fn default_session_lifetime_secs() -> i64 {
    24 * 3600
}

fn default_public_paths() -> Vec<String> {
    vec![
        "/healthz".into(),
        "/api/auth/login".into(),
        "/api/auth/logout".into(),
        "/api/auth/me".into(),
        "/api/auth/oidc/".into(),
    ]
}

fn default_agent_window_secs() -> i64 {
    5 * 60
}

fn default_rate_limit_rate() -> u32 {
    10
}

fn default_rate_limit_burst() -> u32 {
    20
}

fn default_oidc_scopes() -> Vec<String> {
    vec!["openid".into(), "profile".into(), "email".into()]
}

fn default_role_viewer() -> String {
    "viewer".into()
}

/// Load configuration from `AVIKA__*` environment variables (double
/// underscore as the nesting separator, e.g. `AVIKA__OIDC__ISSUER`),
/// falling back to the defaults above.
pub fn load() -> Result<GatewayConfig, ConfigError> {
    let builder = Config::builder().add_source(Environment::with_prefix("AVIKA").separator("__"));
    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err| ConfigError::Message(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_environment() {
        let config = load().expect("config loads");
        assert_eq!(config.session_cookie_name, "avika_session");
        assert_eq!(config.rate_limit_refill_per_sec, 10);
        assert!(config.auth_enabled);
    }

    #[test]
    fn group_mapping_parses_json_or_defaults_empty() {
        let mut settings = OidcSettings::default();
        assert!(settings.group_mapping().is_empty());
        settings.group_mapping_json = Some("{\"team-admin\":\"Admins\"}".into());
        let mapping = settings.group_mapping();
        assert_eq!(mapping.get("team-admin"), Some(&"Admins".to_string()));
    }
}
