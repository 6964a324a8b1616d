//! External-Identity Bridge (spec §4.6): a standard OpenID-Connect
//! authorisation-code flow against a configured issuer, using
//! `reqwest`/`url` for the outbound calls as the teacher's gateway does for
//! its own HTTP dependencies, and capability traits for provisioning so the
//! bridge never reaches into a concrete user-store implementation (spec §9
//! "Cyclic graphs and callback shapes").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{error, warn};
use url::Url;

use crate::error::GatewayError;
use crate::permissions::Role;
use crate::session::{Identity, SessionStore};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const STATE_MAX_AGE: chrono::Duration = chrono::Duration::minutes(10);
const STATE_SWEEP_MAX_AGE: chrono::Duration = chrono::Duration::minutes(15);

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UserInfo {
    email: Option<String>,
    preferred_username: Option<String>,
    #[serde(default)]
    sub: String,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Debug, Clone)]
struct CsrfStateRecord {
    created_at: DateTime<Utc>,
    redirect: String,
}

pub struct OidcSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub group_mapping: HashMap<String, String>,
    pub default_role: String,
    pub auto_provision: bool,
}

/// Get-or-create/update-email capability over the real user store.
pub trait UserProvisioner: Send + Sync {
    fn get_user(&self, username: &str) -> Option<()>;
    fn create_user(&self, username: &str, email: Option<&str>) -> Result<(), GatewayError>;
    fn update_email(&self, username: &str, email: &str) -> Result<(), GatewayError>;
}

/// Team-membership sync capability over the real team store.
pub trait TeamMapper: Send + Sync {
    fn add_user_to_team_by_name(&self, username: &str, team_name: &str) -> Result<(), GatewayError>;
    fn remove_from_all_teams(&self, username: &str) -> Result<(), GatewayError>;
    fn get_team_by_name(&self, team_name: &str) -> Option<()>;
}

pub struct CallbackOutcome {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub redirect: String,
    pub identity: Identity,
}

pub struct OidcBridge {
    client: reqwest::Client,
    discovery: DiscoveryDocument,
    settings: OidcSettings,
    state_store: Mutex<HashMap<String, CsrfStateRecord>>,
    shutdown: Notify,
}

impl OidcBridge {
    /// Fetch `{issuer}/.well-known/openid-configuration` and cache the
    /// endpoints it names. Construction fails outright on any discovery
    /// error, per spec §4.6.
    pub async fn discover(issuer: &str, settings: OidcSettings) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Internal(err.to_string()))?;

        let discovery_url = format!("{}/.well-known/openid-configuration", issuer.trim_end_matches('/'));
        let discovery: DiscoveryDocument = client
            .get(&discovery_url)
            .send()
            .await
            .map_err(|err| GatewayError::Upstream(format!("discovery request failed: {err}")))?
            .error_for_status()
            .map_err(|err| GatewayError::Upstream(format!("discovery returned error status: {err}")))?
            .json()
            .await
            .map_err(|err| GatewayError::Upstream(format!("discovery response malformed: {err}")))?;

        Ok(Self::from_discovery_document(client, discovery, settings))
    }

    fn from_discovery_document(
        client: reqwest::Client,
        discovery: DiscoveryDocument,
        settings: OidcSettings,
    ) -> Self {
        Self {
            client,
            discovery,
            settings,
            state_store: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
        }
    }

    /// Build the provider authorisation URL and register a fresh CSRF
    /// state entry for `redirect`.
    pub fn begin_auth(&self, redirect: &str) -> Result<String, GatewayError> {
        let state = generate_state();
        self.state_store.lock().insert(
            state.clone(),
            CsrfStateRecord {
                created_at: Utc::now(),
                redirect: redirect.to_string(),
            },
        );

        let mut url = Url::parse(&self.discovery.authorization_endpoint)
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", &self.settings.redirect_uri)
            .append_pair("scope", &self.settings.scopes.join(" "))
            .append_pair("state", &state);
        Ok(url.to_string())
    }

    /// Consume a CSRF state entry exactly once: lookup and removal happen
    /// under one lock acquisition, so no two callers can both succeed with
    /// the same state.
    fn consume_state(&self, state: &str) -> Result<String, GatewayError> {
        let mut store = self.state_store.lock();
        let record = store
            .remove(state)
            .ok_or_else(|| GatewayError::BadRequest("unknown or already-used state".into()))?;
        if Utc::now() - record.created_at > STATE_MAX_AGE {
            return Err(GatewayError::BadRequest("state expired".into()));
        }
        Ok(record.redirect)
    }

    pub fn sweep_state(&self) {
        let now = Utc::now();
        self.state_store
            .lock()
            .retain(|_, record| now - record.created_at <= STATE_SWEEP_MAX_AGE);
    }

    pub fn state_count(&self) -> usize {
        self.state_store.lock().len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => bridge.sweep_state(),
                    _ = bridge.shutdown.notified() => break,
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the callback leg: consume state, exchange the code, fetch
    /// userinfo, provision/team-sync, mint a session.
    pub async fn complete_login(
        &self,
        code: &str,
        state: &str,
        provisioner: &dyn UserProvisioner,
        team_mapper: &dyn TeamMapper,
        sessions: &SessionStore,
    ) -> Result<CallbackOutcome, GatewayError> {
        let redirect = self.consume_state(state)?;

        let token = self.exchange_code(code).await?;
        let userinfo = self.fetch_userinfo(&token.access_token).await?;

        let username = first_non_empty(&[
            userinfo.email.as_deref(),
            userinfo.preferred_username.as_deref(),
            Some(userinfo.sub.as_str()),
        ])
        .ok_or_else(|| GatewayError::Upstream("userinfo carried no usable identifier".into()))?
        .to_string();

        if self.settings.auto_provision && provisioner.get_user(&username).is_none() {
            provisioner.create_user(&username, userinfo.email.as_deref())?;
        } else if let Some(email) = userinfo.email.as_deref() {
            let _ = provisioner.update_email(&username, email);
        }

        team_mapper.remove_from_all_teams(&username)?;
        let mut mapped_teams = Vec::new();
        for group in &userinfo.groups {
            if let Some(team_name) = self.settings.group_mapping.get(group) {
                team_mapper.add_user_to_team_by_name(&username, team_name)?;
                mapped_teams.push(team_name.clone());
            }
        }

        let role = derive_role(&mapped_teams, &self.settings.default_role);

        let identity = Identity {
            subject: username,
            display_name: userinfo
                .preferred_username
                .clone()
                .unwrap_or_else(|| identity_fallback_name(&userinfo)),
            role,
            is_superadmin: role >= Role::Admin,
        };

        let (session_token, expires_at) = sessions.mint(identity.clone(), false).await;

        Ok(CallbackOutcome {
            token: session_token,
            expires_at,
            redirect,
            identity,
        })
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, GatewayError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
        ];
        let response = self
            .client
            .post(&self.discovery.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|err| {
                error!(error = %err, "oidc token exchange failed");
                GatewayError::Upstream("token exchange failed".into())
            })?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "oidc token endpoint returned error status");
            return Err(GatewayError::Upstream("token exchange failed".into()));
        }
        response.json().await.map_err(|err| {
            error!(error = %err, "oidc token response malformed");
            GatewayError::Upstream("token exchange failed".into())
        })
    }

    async fn fetch_userinfo(&self, access_token: &str) -> Result<UserInfo, GatewayError> {
        let response = self
            .client
            .get(&self.discovery.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| {
                error!(error = %err, "oidc userinfo fetch failed");
                GatewayError::Upstream("userinfo fetch failed".into())
            })?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "oidc userinfo endpoint returned error status");
            return Err(GatewayError::Upstream("userinfo fetch failed".into()));
        }
        response.json().await.map_err(|err| {
            error!(error = %err, "oidc userinfo response malformed");
            GatewayError::Upstream("userinfo fetch failed".into())
        })
    }
}

fn identity_fallback_name(userinfo: &UserInfo) -> String {
    userinfo
        .email
        .clone()
        .unwrap_or_else(|| userinfo.sub.clone())
}

fn first_non_empty<'a>(candidates: &[Option<&'a str>]) -> Option<&'a str> {
    candidates
        .iter()
        .flatten()
        .find(|value| !value.is_empty())
        .copied()
}

/// "If any mapped team name contains the substring `admin`
/// (case-insensitive), the role is admin; otherwise the configured default
/// role."
fn derive_role(mapped_teams: &[String], default_role: &str) -> Role {
    if mapped_teams
        .iter()
        .any(|team| team.to_ascii_lowercase().contains("admin"))
    {
        return Role::Admin;
    }
    Role::parse(default_role).unwrap_or(Role::Read)
}

fn generate_state() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
    use base64::Engine as _;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    BASE64_URL.encode(bytes)
}
