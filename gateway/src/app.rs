//! Assembles the access-control components into a single `axum::Router`.
//! Split out of `main` so integration tests can build the exact same
//! router `tower::ServiceExt::oneshot` drives, mirroring the teacher's
//! `noa_api::routes::tests` idiom.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent_auth::{AgentAuthenticator, AgentAuthenticatorConfig};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::middleware::{gate, rate_limit_gate, AuthenticatedPrincipal, GateState};
use crate::oidc::{OidcBridge, OidcSettings, TeamMapper, UserProvisioner};
use crate::permissions::{AllowAdminsOnly, PermissionOracle};
use crate::rate_limit::RateLimiter;
use crate::session::{Identity, SessionStore};
use crate::user_auth::{UserAuthenticator, UserDirectory, UserRecord};

pub struct InMemoryUserDirectory {
    records: SyncMutex<HashMap<String, UserRecord>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self {
            records: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn seed(&self, record: UserRecord) {
        self.records.lock().insert(record.username.clone(), record);
    }
}

impl Default for InMemoryUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn lookup(&self, username: &str) -> Option<UserRecord> {
        self.records.lock().get(username).cloned()
    }

    fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn update_password_hash(&self, username: &str, new_hash: &str) -> Result<(), GatewayError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(username)
            .ok_or_else(|| GatewayError::NotFound("user not found".into()))?;
        record.password_hash = new_hash.to_string();
        Ok(())
    }
}

struct NoopProvisioner;

impl UserProvisioner for NoopProvisioner {
    fn get_user(&self, _username: &str) -> Option<()> {
        None
    }

    fn create_user(&self, _username: &str, _email: Option<&str>) -> Result<(), GatewayError> {
        Ok(())
    }

    fn update_email(&self, _username: &str, _email: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

struct NoopTeamMapper;

impl TeamMapper for NoopTeamMapper {
    fn add_user_to_team_by_name(&self, _username: &str, _team_name: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    fn remove_from_all_teams(&self, _username: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    fn get_team_by_name(&self, _team_name: &str) -> Option<()> {
        None
    }
}

struct AppState {
    config: GatewayConfig,
    sessions: Arc<SessionStore>,
    user_auth: Arc<UserAuthenticator>,
    #[allow(dead_code)]
    permissions: Arc<PermissionOracle>,
    oidc: Option<Arc<OidcBridge>>,
    provisioner: NoopProvisioner,
    team_mapper: NoopTeamMapper,
}

/// Everything `main` needs to serve the router and shut it down cleanly.
pub struct Assembled {
    pub router: Router,
    pub sessions: Arc<SessionStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub agent_auth: Arc<AgentAuthenticator>,
    pub oidc: Option<Arc<OidcBridge>>,
}

/// Build the full router plus the long-lived components `main` owns for
/// shutdown and sweeper lifecycle. `directory` lets callers (tests, or an
/// embedding binary) seed users before the router starts serving; a fresh
/// `InMemoryUserDirectory` is the default standalone backing store.
pub async fn assemble(
    config: GatewayConfig,
    directory: Arc<dyn UserDirectory>,
) -> anyhow::Result<Assembled> {
    let user_auth = Arc::new(UserAuthenticator::new(
        directory,
        config.auth_enabled,
        config.initial_secret_file.clone(),
    ));

    let sessions = Arc::new(SessionStore::new(config.session_lifetime_secs));
    sessions.spawn_sweeper(Duration::from_secs(5 * 60));

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_refill_per_sec,
        config.rate_limit_burst,
    ));
    rate_limiter.spawn_sweeper(Duration::from_secs(10 * 60));

    let agent_auth = Arc::new(AgentAuthenticator::new(AgentAuthenticatorConfig {
        enabled: config.agent_enabled,
        psk_hex: config.agent_psk_hex.clone(),
        auto_enroll: config.agent_auto_enroll,
        timestamp_window_secs: config.agent_timestamp_window_secs,
        require_host_match: config.agent_require_host_match,
    }));

    let permissions = Arc::new(PermissionOracle::new(Box::new(AllowAdminsOnly)));

    let oidc = match (&config.oidc.issuer, &config.oidc.client_id) {
        (Some(issuer), Some(client_id)) => {
            let settings = OidcSettings {
                client_id: client_id.clone(),
                client_secret: config.oidc.client_secret.clone().unwrap_or_default(),
                redirect_uri: config.oidc.redirect_uri.clone().unwrap_or_default(),
                scopes: config.oidc.scopes.clone(),
                group_mapping: config.oidc.group_mapping(),
                default_role: config.oidc.default_role.clone(),
                auto_provision: config.oidc.auto_provision,
            };
            match OidcBridge::discover(issuer, settings).await {
                Ok(bridge) => {
                    let bridge = Arc::new(bridge);
                    bridge.spawn_sweeper(Duration::from_secs(5 * 60));
                    Some(bridge)
                }
                Err(err) => {
                    warn!(error = %err, "oidc discovery failed; oidc login routes disabled");
                    None
                }
            }
        }
        _ => None,
    };

    let app_state = Arc::new(AppState {
        config: config.clone(),
        sessions: Arc::clone(&sessions),
        user_auth,
        permissions,
        oidc: oidc.clone(),
        provisioner: NoopProvisioner,
        team_mapper: NoopTeamMapper,
    });

    let gate_state = Arc::new(GateState {
        sessions: Arc::clone(&sessions),
        auth_enabled: config.auth_enabled,
        public_paths: config.public_paths.clone(),
        session_cookie_name: config.session_cookie_name.clone(),
    });

    // ServiceBuilder applies layers in listed order: a request passes
    // through the rate limiter first, then the session gate, matching
    // the "Rate Limiter -> Gate Middleware -> downstream" flow.
    let middleware = tower::ServiceBuilder::new()
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&rate_limiter),
            rate_limit_gate,
        ))
        .layer(axum::middleware::from_fn_with_state(gate_state, gate));

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/auth/change-password", post(change_password))
        .route("/api/auth/oidc/login", get(oidc_login))
        .route("/api/auth/oidc/callback", get(oidc_callback))
        .layer(middleware)
        .with_state(app_state);

    Ok(Assembled {
        router,
        sessions,
        rate_limiter,
        agent_auth,
        oidc,
    })
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct UserPayload {
    username: String,
    role: String,
}

impl From<&Identity> for UserPayload {
    fn from(identity: &Identity) -> Self {
        Self {
            username: identity.subject.clone(),
            role: format!("{:?}", identity.role).to_lowercase(),
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn login(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Response {
    if body.username.trim().is_empty() || body.password.is_empty() {
        return GatewayError::BadRequest("username and password are required".into()).into_response();
    }

    let client_ip_value = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let outcome = match app
        .user_auth
        .authenticate(&body.username, &body.password, &client_ip_value)
    {
        Ok(outcome) => outcome,
        Err(err) => return err.into_response(),
    };

    let (token, expires_at) = app
        .sessions
        .mint(outcome.identity.clone(), outcome.must_change_password)
        .await;

    let mut response = Json(serde_json::json!({
        "success": true,
        "user": UserPayload::from(&outcome.identity),
        "expires_at": expires_at.to_rfc3339(),
        "require_password_change": outcome.must_change_password,
    }))
    .into_response();

    response.headers_mut().append(
        header::SET_COOKIE,
        build_cookie(&app.config, &token, expires_at).parse().unwrap(),
    );
    response
}

async fn logout(State(app): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = extract_session_cookie(&headers, &app.config.session_cookie_name) {
        app.sessions.revoke(&token).await;
    }

    let mut response = Json(serde_json::json!({ "success": true })).into_response();
    response
        .headers_mut()
        .append(header::SET_COOKIE, clear_cookie(&app.config).parse().unwrap());
    response
}

async fn me(State(app): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(token) = extract_session_cookie(&headers, &app.config.session_cookie_name) else {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "authenticated": false }))).into_response();
    };
    match app.sessions.validate(&token).await {
        Some(session) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "authenticated": true,
                "user": UserPayload::from(&session.identity),
            })),
        )
            .into_response(),
        None => (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "authenticated": false }))).into_response(),
    }
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(app): State<Arc<AppState>>,
    Extension(principal): Extension<AuthenticatedPrincipal>,
    Json(body): Json<ChangePasswordRequest>,
) -> Response {
    match app.user_auth.change_password(
        &principal.identity.subject,
        &body.current_password,
        &body.new_password,
    ) {
        Ok(()) => {
            app.sessions
                .clear_must_change_password(&principal.identity.subject)
                .await;
            Json(serde_json::json!({ "success": true })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[derive(Deserialize)]
struct OidcLoginQuery {
    #[serde(default = "default_redirect")]
    redirect: String,
}

fn default_redirect() -> String {
    "/".to_string()
}

async fn oidc_login(State(app): State<Arc<AppState>>, Query(query): Query<OidcLoginQuery>) -> Response {
    let Some(bridge) = &app.oidc else {
        return GatewayError::NotFound("oidc is not configured".into()).into_response();
    };
    match bridge.begin_auth(&query.redirect) {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Deserialize)]
struct OidcCallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn oidc_callback(
    State(app): State<Arc<AppState>>,
    Query(query): Query<OidcCallbackQuery>,
) -> Response {
    let Some(bridge) = &app.oidc else {
        return GatewayError::NotFound("oidc is not configured".into()).into_response();
    };

    if let Some(error) = query.error {
        let detail = query.error_description.unwrap_or(error);
        return GatewayError::BadRequest(detail).into_response();
    }

    let (Some(code), Some(state)) = (query.code, query.state) else {
        return GatewayError::BadRequest("missing code or state".into()).into_response();
    };

    let outcome = match bridge
        .complete_login(&code, &state, &app.provisioner, &app.team_mapper, &app.sessions)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return err.into_response(),
    };

    let mut response = Redirect::to(&outcome.redirect).into_response();
    response.headers_mut().append(
        header::SET_COOKIE,
        build_cookie(&app.config, &outcome.token, outcome.expires_at)
            .parse()
            .unwrap(),
    );
    response
}

fn extract_session_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let mut parts = pair.trim().splitn(2, '=');
        let name = parts.next()?.trim();
        let value = parts.next()?.trim();
        (name == cookie_name).then(|| value.to_string())
    })
}

fn build_cookie(config: &GatewayConfig, token: &str, expires_at: chrono::DateTime<chrono::Utc>) -> String {
    let secure = if config.cookie_secure { "; Secure" } else { "" };
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Expires={}{}",
        config.session_cookie_name,
        token,
        expires_at.to_rfc2822(),
        secure,
    )
}

fn clear_cookie(config: &GatewayConfig) -> String {
    format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=-1; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
        config.session_cookie_name
    )
}
