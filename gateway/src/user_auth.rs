//! User Authenticator (spec §4.5): password verification against an
//! injected user directory, with an in-memory bootstrap fallback when the
//! directory is empty. The directory is a capability trait object rather
//! than a class hierarchy, per spec §9 "Dynamic dispatch" — the same shape
//! the teacher gives its `auth.rs` credential sources.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::hasher::{hash_password, verify_password};
use crate::permissions::Role;
use crate::session::Identity;

pub const BOOTSTRAP_USERNAME: &str = "admin";
pub const BOOTSTRAP_PASSWORD: &str = "admin";
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

/// Injected lookup/mutation capability over the real user store. The
/// authenticator never assumes a concrete backend.
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, username: &str) -> Option<UserRecord>;
    fn is_empty(&self) -> bool;
    fn update_password_hash(&self, username: &str, new_hash: &str) -> Result<(), GatewayError>;
}

pub struct AuthOutcome {
    pub identity: Identity,
    pub must_change_password: bool,
}

struct BootstrapUser {
    username: String,
    password_hash: String,
}

pub struct UserAuthenticator {
    directory: Arc<dyn UserDirectory>,
    password_change_set: Mutex<HashSet<String>>,
    bootstrap: Mutex<Option<BootstrapUser>>,
    initial_secret_file: Option<PathBuf>,
}

impl UserAuthenticator {
    /// Construct the authenticator, running the bootstrap step synchronously
    /// if `auth_enabled` and the directory reports no users. Bootstrap is a
    /// one-time effect: it prints the credential block and optionally writes
    /// the secret file before the authenticator is ever handed a request.
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        auth_enabled: bool,
        initial_secret_file: Option<PathBuf>,
    ) -> Self {
        let mut password_change_set = HashSet::new();
        let mut bootstrap = None;

        if auth_enabled && directory.is_empty() {
            let password_hash = hash_password(BOOTSTRAP_PASSWORD.as_bytes());
            password_change_set.insert(BOOTSTRAP_USERNAME.to_string());
            print_bootstrap_banner(BOOTSTRAP_USERNAME, BOOTSTRAP_PASSWORD);
            if let Some(path) = &initial_secret_file {
                if let Err(err) = write_secret_file(path, BOOTSTRAP_USERNAME, BOOTSTRAP_PASSWORD) {
                    warn!(error = %err, "failed to persist initial secret file");
                }
            }
            bootstrap = Some(BootstrapUser {
                username: BOOTSTRAP_USERNAME.to_string(),
                password_hash,
            });
        }

        Self {
            directory,
            password_change_set: Mutex::new(password_change_set),
            bootstrap: Mutex::new(bootstrap),
            initial_secret_file,
        }
    }

    fn resolve(&self, username: &str) -> Option<UserRecord> {
        if let Some(record) = self.directory.lookup(username) {
            return Some(record);
        }
        let bootstrap = self.bootstrap.lock();
        bootstrap.as_ref().and_then(|b| {
            (b.username == username).then(|| UserRecord {
                username: b.username.clone(),
                password_hash: b.password_hash.clone(),
                role: Role::Admin,
            })
        })
    }

    /// Verify `(username, password)`. Always logs one outcome line; never
    /// logs the password or hash.
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<AuthOutcome, GatewayError> {
        let record = self.resolve(username);
        let outcome = match &record {
            Some(record) if verify_password(password.as_bytes(), &record.password_hash) => {
                let must_change_password = self.password_change_set.lock().contains(username);
                Ok(AuthOutcome {
                    identity: Identity {
                        subject: record.username.clone(),
                        display_name: record.username.clone(),
                        role: record.role,
                        is_superadmin: record.role >= Role::Admin,
                    },
                    must_change_password,
                })
            }
            _ => Err(GatewayError::Unauthenticated("invalid credentials".into())),
        };

        info!(
            username,
            client_ip,
            outcome = if outcome.is_ok() { "success" } else { "failure" },
            pending_password_change = outcome
                .as_ref()
                .map(|o| o.must_change_password)
                .unwrap_or(false),
            "login attempt"
        );

        outcome
    }

    /// Change `username`'s password. Requires the caller to have already
    /// validated the session and supplied the correct current password;
    /// this function re-verifies the current password itself as the
    /// authoritative check.
    pub fn change_password(
        &self,
        username: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), GatewayError> {
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(GatewayError::BadRequest(format!(
                "new password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let record = self
            .resolve(username)
            .ok_or_else(|| GatewayError::Unauthenticated("invalid credentials".into()))?;
        if !verify_password(current_password.as_bytes(), &record.password_hash) {
            return Err(GatewayError::Unauthenticated("invalid credentials".into()));
        }

        let new_hash = hash_password(new_password.as_bytes());

        let mut bootstrap = self.bootstrap.lock();
        let updated_bootstrap = match bootstrap.as_mut() {
            Some(b) if b.username == username => {
                b.password_hash = new_hash.clone();
                true
            }
            _ => false,
        };
        drop(bootstrap);

        if !updated_bootstrap {
            self.directory.update_password_hash(username, &new_hash)?;
        }

        self.password_change_set.lock().remove(username);

        if let Some(path) = &self.initial_secret_file {
            if path.exists() {
                if let Err(err) = fs::remove_file(path) {
                    warn!(error = %err, "failed to delete initial secret file");
                }
            }
        }

        Ok(())
    }

    pub fn must_change_password(&self, username: &str) -> bool {
        self.password_change_set.lock().contains(username)
    }
}

fn print_bootstrap_banner(username: &str, password: &str) {
    println!("============================================================");
    println!("[SECURITY] Bootstrap administrator account created.");
    println!("[SECURITY]   username: {username}");
    println!("[SECURITY]   password: {password}");
    println!("[SECURITY] Change this password immediately after first login.");
    println!("============================================================");
}

fn write_secret_file(path: &PathBuf, username: &str, password: &str) -> std::io::Result<()> {
    let contents = format!("Username: {username}\nPassword: {password}\n");
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, permissions)?;
    }

    Ok(())
}
