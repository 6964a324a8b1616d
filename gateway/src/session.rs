//! Session Store (spec §4.4): opaque random session tokens mapped to an
//! identity, with a sweeper for expired entries. Uses `tokio::sync::RwLock`
//! for the map, matching the async-contexted shared-state idiom the teacher
//! uses for its service registries, and `tokio::sync::Notify` to let the
//! background sweeper shut down cleanly instead of being detached forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::permissions::Role;

#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub display_name: String,
    pub role: Role,
    pub is_superadmin: bool,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    identity: Identity,
    expires_at: DateTime<Utc>,
    must_change_password: bool,
}

/// What [`SessionStore::validate`] returns: the principal plus the flags
/// that travel with the session rather than the principal itself.
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub identity: Identity,
    pub must_change_password: bool,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    lifetime: chrono::Duration,
    shutdown: Arc<Notify>,
}

impl SessionStore {
    pub fn new(lifetime_secs: i64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            lifetime: chrono::Duration::seconds(lifetime_secs),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Mint a fresh opaque session token for `identity`. Generation and
    /// insertion happen under one write-lock acquisition, so no caller ever
    /// observes a token before its record exists.
    pub async fn mint(&self, identity: Identity, must_change_password: bool) -> (String, DateTime<Utc>) {
        let token = generate_token();
        let expires_at = Utc::now() + self.lifetime;
        self.sessions.write().await.insert(
            token.clone(),
            SessionEntry {
                identity,
                expires_at,
                must_change_password,
            },
        );
        (token, expires_at)
    }

    /// Resolve a token to its principal, if present and unexpired. Never
    /// updates last-seen — expiry is absolute, not sliding.
    pub async fn validate(&self, token: &str) -> Option<ValidatedSession> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(token)?;
        if entry.expires_at <= Utc::now() {
            return None;
        }
        Some(ValidatedSession {
            identity: entry.identity.clone(),
            must_change_password: entry.must_change_password,
        })
    }

    /// Idempotent: removing an absent token is not an error.
    pub async fn revoke(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    /// Clear the must-change-password flag on every live session for
    /// `subject`, used after a successful password change.
    pub async fn clear_must_change_password(&self, subject: &str) {
        let mut sessions = self.sessions.write().await;
        for entry in sessions.values_mut() {
            if entry.identity.subject == subject {
                entry.must_change_password = false;
            }
        }
    }

    pub async fn revoke_all_for_subject(&self, subject: &str) {
        self.sessions
            .write()
            .await
            .retain(|_, entry| entry.identity.subject != subject);
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn sweep_expired(&self) {
        let now = Utc::now();
        self.sessions.write().await.retain(|_, entry| entry.expires_at > now);
    }

    /// Spawn the background sweep loop. The returned handle's abort is not
    /// relied on for shutdown — call [`SessionStore::shutdown`] instead so
    /// the loop exits after its current sleep rather than mid-sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.sweep_expired().await,
                    _ = shutdown.notified() => break,
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    BASE64_URL.encode(bytes)
}

/// A stable per-process identifier for correlating a request across logs,
/// independent of the session token. Not security-sensitive.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_identity() -> Identity {
        Identity {
            subject: "u1".into(),
            display_name: "User One".into(),
            role: Role::Write,
            is_superadmin: false,
        }
    }

    #[tokio::test]
    async fn mint_then_validate_round_trips() {
        let store = SessionStore::new(3600);
        let (token, _) = store.mint(sample_identity(), false).await;
        let session = store.validate(&token).await.expect("valid session");
        assert_eq!(session.identity.subject, "u1");
        assert!(!session.must_change_password);
    }

    #[tokio::test]
    async fn revoke_invalidates_token() {
        let store = SessionStore::new(3600);
        let (token, _) = store.mint(sample_identity(), false).await;
        store.revoke(&token).await;
        assert!(store.validate(&token).await.is_none());
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let store = SessionStore::new(3600);
        let (token, _) = store.mint(sample_identity(), false).await;
        store.revoke(&token).await;
        store.revoke(&token).await;
        assert!(store.validate(&token).await.is_none());
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let store = SessionStore::new(-1);
        let (token, _) = store.mint(sample_identity(), false).await;
        assert!(store.validate(&token).await.is_none());
    }

    #[tokio::test]
    async fn revoke_all_for_subject_clears_every_session() {
        let store = SessionStore::new(3600);
        let (t1, _) = store.mint(sample_identity(), false).await;
        let (t2, _) = store.mint(sample_identity(), false).await;
        store.revoke_all_for_subject("u1").await;
        assert!(store.validate(&t1).await.is_none());
        assert!(store.validate(&t2).await.is_none());
    }

    #[tokio::test]
    async fn must_change_password_flag_travels_with_session_until_cleared() {
        let store = SessionStore::new(3600);
        let (token, _) = store.mint(sample_identity(), true).await;
        assert!(store.validate(&token).await.unwrap().must_change_password);
        store.clear_must_change_password("u1").await;
        assert!(!store.validate(&token).await.unwrap().must_change_password);
    }

    #[tokio::test]
    async fn sweeper_removes_expired_entries_on_tick() {
        let store = Arc::new(SessionStore::new(-1));
        store.mint(sample_identity(), false).await;
        assert_eq!(store.active_count().await, 1);
        let handle = store.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.active_count().await, 0);
        store.shutdown();
        let _ = handle.await;
    }
}
