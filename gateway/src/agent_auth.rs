//! Agent Authenticator (spec §4.7): PSK-based HMAC verification with a
//! replay window and an enrolment state machine, guarding the gRPC
//! ingress. Lock shape mirrors the rate limiter's
//! `parking_lot::Mutex<HashMap<...>>` over the registered-agent table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::GatewayError;
use crate::hasher::{generate_psk_hex, verify_agent_signature};

#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub agent_id: String,
    pub hostname: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentContext {
    pub authenticated: bool,
}

pub struct AgentAuthenticatorConfig {
    pub enabled: bool,
    pub psk_hex: Option<String>,
    pub auto_enroll: bool,
    pub timestamp_window_secs: i64,
    pub require_host_match: bool,
}

pub struct AgentAuthenticator {
    enabled: bool,
    psk_hex: String,
    auto_enroll: bool,
    window: chrono::Duration,
    require_host_match: bool,
    agents: Mutex<HashMap<String, RegisteredAgent>>,
}

impl AgentAuthenticator {
    /// Construct the authenticator. If enabled with no configured PSK, a
    /// fresh one is generated and published to the operator log once, same
    /// framing convention as the user-authenticator bootstrap banner.
    pub fn new(config: AgentAuthenticatorConfig) -> Self {
        let psk_hex = if config.enabled {
            config.psk_hex.unwrap_or_else(|| {
                let generated = generate_psk_hex();
                print_psk_banner(&generated);
                generated
            })
        } else {
            String::new()
        };

        Self {
            enabled: config.enabled,
            psk_hex,
            auto_enroll: config.auto_enroll,
            window: chrono::Duration::seconds(config.timestamp_window_secs),
            require_host_match: config.require_host_match,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Verify an incoming call. Signature verification always precedes the
    /// enrolment lookup so no registration state leaks to a caller without
    /// the PSK (spec §4.7 "Order matters").
    pub fn verify(
        &self,
        agent_id: &str,
        hostname: &str,
        signature: &str,
        timestamp: &str,
    ) -> Result<AgentContext, GatewayError> {
        if !self.enabled {
            return Ok(AgentContext { authenticated: true });
        }

        if signature.is_empty() || timestamp.is_empty() {
            return Err(GatewayError::Unauthenticated("missing credentials".into()));
        }

        let parsed_timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| GatewayError::Unauthenticated("invalid timestamp".into()))?
            .with_timezone(&Utc);

        let now = Utc::now();
        let skew = if now > parsed_timestamp {
            now - parsed_timestamp
        } else {
            parsed_timestamp - now
        };
        if skew > self.window {
            return Err(GatewayError::Unauthenticated("outside window".into()));
        }

        if !verify_agent_signature(&self.psk_hex, agent_id, hostname, timestamp, signature) {
            return Err(GatewayError::Unauthenticated("invalid signature".into()));
        }

        let mut agents = self.agents.lock();
        match agents.get_mut(agent_id) {
            None if self.auto_enroll => {
                agents.insert(
                    agent_id.to_string(),
                    RegisteredAgent {
                        agent_id: agent_id.to_string(),
                        hostname: hostname.to_string(),
                        first_seen: now,
                        last_seen: now,
                        approved: true,
                    },
                );
                Ok(AgentContext { authenticated: true })
            }
            None => Err(GatewayError::Unauthenticated("not registered".into())),
            Some(record) if self.require_host_match && record.hostname != hostname => {
                Err(GatewayError::Forbidden("hostname mismatch".into()))
            }
            Some(record) if !record.approved => Err(GatewayError::Forbidden("pending approval".into())),
            Some(record) => {
                record.last_seen = now;
                Ok(AgentContext { authenticated: true })
            }
        }
    }

    pub fn register(&self, agent_id: &str, hostname: &str, approved: bool) {
        let now = Utc::now();
        self.agents.lock().insert(
            agent_id.to_string(),
            RegisteredAgent {
                agent_id: agent_id.to_string(),
                hostname: hostname.to_string(),
                first_seen: now,
                last_seen: now,
                approved,
            },
        );
    }

    pub fn approve(&self, agent_id: &str) -> Result<(), GatewayError> {
        let mut agents = self.agents.lock();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| GatewayError::NotFound("agent not found".into()))?;
        record.approved = true;
        Ok(())
    }

    pub fn revoke(&self, agent_id: &str) -> Result<(), GatewayError> {
        self.agents
            .lock()
            .remove(agent_id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound("agent not found".into()))
    }

    pub fn list(&self) -> Vec<RegisteredAgent> {
        self.agents.lock().values().cloned().collect()
    }
}

fn print_psk_banner(psk_hex: &str) {
    println!("============================================================");
    println!("[SECURITY] Generated agent pre-shared key (no AVIKA__AGENT_PSK_HEX configured).");
    println!("[SECURITY]   psk: {psk_hex}");
    println!("[SECURITY] Distribute this key to edge agents out-of-band.");
    println!("============================================================");
    warn!("agent PSK was auto-generated; configure AVIKA__AGENT_PSK_HEX to pin it across restarts");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::sign_agent_message;

    fn config_with_psk(psk_hex: &str) -> AgentAuthenticatorConfig {
        AgentAuthenticatorConfig {
            enabled: true,
            psk_hex: Some(psk_hex.to_string()),
            auto_enroll: true,
            timestamp_window_secs: 300,
            require_host_match: false,
        }
    }

    #[test]
    fn disabled_authenticator_admits_everything() {
        let auth = AgentAuthenticator::new(AgentAuthenticatorConfig {
            enabled: false,
            psk_hex: None,
            auto_enroll: false,
            timestamp_window_secs: 300,
            require_host_match: false,
        });
        let result = auth.verify("", "", "", "");
        assert!(result.unwrap().authenticated);
    }

    #[test]
    fn valid_signature_within_window_auto_enrolls() {
        let psk = generate_psk_hex();
        let auth = AgentAuthenticator::new(config_with_psk(&psk));
        let timestamp = Utc::now().to_rfc3339();
        let sig = sign_agent_message(&psk, "a1", "h1", &timestamp).unwrap();
        let result = auth.verify("a1", "h1", &sig, &timestamp);
        assert!(result.unwrap().authenticated);
        assert_eq!(auth.list().len(), 1);
    }

    #[test]
    fn replay_outside_window_is_rejected() {
        let psk = generate_psk_hex();
        let auth = AgentAuthenticator::new(config_with_psk(&psk));
        let old_timestamp = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
        let sig = sign_agent_message(&psk, "a1", "h1", &old_timestamp).unwrap();
        let result = auth.verify("a1", "h1", &sig, &old_timestamp);
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let auth = AgentAuthenticator::new(config_with_psk(&generate_psk_hex()));
        assert!(auth.verify("a1", "h1", "", "").is_err());
    }

    #[test]
    fn without_auto_enroll_unknown_agent_is_rejected() {
        let psk = generate_psk_hex();
        let mut config = config_with_psk(&psk);
        config.auto_enroll = false;
        let auth = AgentAuthenticator::new(config);
        let timestamp = Utc::now().to_rfc3339();
        let sig = sign_agent_message(&psk, "a1", "h1", &timestamp).unwrap();
        let result = auth.verify("a1", "h1", &sig, &timestamp);
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn pending_approval_agent_is_rejected_until_approved() {
        let psk = generate_psk_hex();
        let auth = AgentAuthenticator::new(config_with_psk(&psk));
        auth.register("a1", "h1", false);
        let timestamp = Utc::now().to_rfc3339();
        let sig = sign_agent_message(&psk, "a1", "h1", &timestamp).unwrap();
        assert!(matches!(
            auth.verify("a1", "h1", &sig, &timestamp),
            Err(GatewayError::Forbidden(_))
        ));
        auth.approve("a1").unwrap();
        let sig2 = sign_agent_message(&psk, "a1", "h1", &timestamp).unwrap();
        assert!(auth.verify("a1", "h1", &sig2, &timestamp).unwrap().authenticated);
    }

    #[test]
    fn host_mismatch_is_rejected_when_required() {
        let psk = generate_psk_hex();
        let mut config = config_with_psk(&psk);
        config.require_host_match = true;
        let auth = AgentAuthenticator::new(config);
        auth.register("a1", "h1", true);
        let timestamp = Utc::now().to_rfc3339();
        let sig = sign_agent_message(&psk, "a1", "h2", &timestamp).unwrap();
        assert!(matches!(
            auth.verify("a1", "h2", &sig, &timestamp),
            Err(GatewayError::Forbidden(_))
        ));
    }

    #[test]
    fn revoke_is_not_idempotent_and_reports_not_found_on_second_call() {
        let psk = generate_psk_hex();
        let auth = AgentAuthenticator::new(config_with_psk(&psk));
        auth.register("a1", "h1", true);
        auth.revoke("a1").unwrap();
        assert!(matches!(auth.revoke("a1"), Err(GatewayError::NotFound(_))));
    }

    #[test]
    fn invalid_signature_is_rejected_before_enrolment_state_is_revealed() {
        let psk = generate_psk_hex();
        let auth = AgentAuthenticator::new(config_with_psk(&psk));
        auth.register("a1", "h1", false);
        let timestamp = Utc::now().to_rfc3339();
        let result = auth.verify("a1", "h1", "not-a-valid-signature", &timestamp);
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }
}
