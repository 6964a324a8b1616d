//! gRPC Gate Middleware (spec §4.9): unary and streaming
//! `tonic::service::Interceptor` implementations over the Agent
//! Authenticator. No business gRPC service is defined here — spec §1
//! places those outside the core's scope — so these interceptors are
//! exposed for an external service builder to attach via
//! `Server::with_interceptor`.

use std::sync::Arc;

use tonic::metadata::MetadataMap;
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::agent_auth::{AgentAuthenticator, AgentContext};
use crate::error::GatewayError;

const HEADER_AGENT_ID: &str = "x-avika-agent-id";
const HEADER_HOSTNAME: &str = "x-avika-hostname";
const HEADER_SIGNATURE: &str = "x-avika-signature";
const HEADER_TIMESTAMP: &str = "x-avika-timestamp";

fn metadata_str<'a>(metadata: &'a MetadataMap, key: &str) -> Result<&'a str, Status> {
    metadata
        .get(key)
        .ok_or_else(|| Status::unauthenticated(format!("missing metadata key {key}")))?
        .to_str()
        .map_err(|_| Status::unauthenticated(format!("metadata key {key} is not valid UTF-8")))
}

fn verify_from_metadata(
    authenticator: &AgentAuthenticator,
    metadata: &MetadataMap,
) -> Result<AgentContext, Status> {
    let agent_id = metadata_str(metadata, HEADER_AGENT_ID)?;
    let hostname = metadata_str(metadata, HEADER_HOSTNAME)?;
    let signature = metadata_str(metadata, HEADER_SIGNATURE)?;
    let timestamp = metadata_str(metadata, HEADER_TIMESTAMP)?;

    authenticator
        .verify(agent_id, hostname, signature, timestamp)
        .map_err(gateway_error_to_status)
}

fn gateway_error_to_status(err: GatewayError) -> Status {
    match err {
        GatewayError::BadRequest(msg) => Status::invalid_argument(msg),
        GatewayError::Unauthenticated(msg) => Status::unauthenticated(msg),
        GatewayError::Forbidden(msg) => Status::permission_denied(msg),
        GatewayError::RateLimited => Status::resource_exhausted("rate limited"),
        GatewayError::NotFound(msg) => Status::not_found(msg),
        GatewayError::Upstream(msg) => Status::internal(msg),
        GatewayError::Internal(msg) => Status::internal(msg),
    }
}

/// Interceptor for unary agent calls.
#[derive(Clone)]
pub struct UnaryAgentInterceptor {
    authenticator: Arc<AgentAuthenticator>,
}

impl UnaryAgentInterceptor {
    pub fn new(authenticator: Arc<AgentAuthenticator>) -> Self {
        Self { authenticator }
    }
}

impl Interceptor for UnaryAgentInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let context = verify_from_metadata(&self.authenticator, request.metadata())?;
        request.extensions_mut().insert(context);
        Ok(request)
    }
}

/// Interceptor for streaming agent calls. Verification happens once at
/// stream setup; the signature covers the connection, not each message.
#[derive(Clone)]
pub struct StreamingAgentInterceptor {
    authenticator: Arc<AgentAuthenticator>,
}

impl StreamingAgentInterceptor {
    pub fn new(authenticator: Arc<AgentAuthenticator>) -> Self {
        Self { authenticator }
    }
}

impl Interceptor for StreamingAgentInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let context = verify_from_metadata(&self.authenticator, request.metadata())?;
        request.extensions_mut().insert(context);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_auth::AgentAuthenticatorConfig;
    use crate::hasher::{generate_psk_hex, sign_agent_message};
    use tonic::metadata::MetadataValue;

    fn authenticator_with_psk(psk: &str) -> Arc<AgentAuthenticator> {
        Arc::new(AgentAuthenticator::new(AgentAuthenticatorConfig {
            enabled: true,
            psk_hex: Some(psk.to_string()),
            auto_enroll: true,
            timestamp_window_secs: 300,
            require_host_match: false,
        }))
    }

    #[test]
    fn unary_interceptor_admits_valid_signature_and_attaches_context() {
        let psk = generate_psk_hex();
        let authenticator = authenticator_with_psk(&psk);
        let mut interceptor = UnaryAgentInterceptor::new(authenticator);

        let timestamp = chrono::Utc::now().to_rfc3339();
        let signature = sign_agent_message(&psk, "a1", "h1", &timestamp).unwrap();

        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(HEADER_AGENT_ID, MetadataValue::try_from("a1").unwrap());
        request
            .metadata_mut()
            .insert(HEADER_HOSTNAME, MetadataValue::try_from("h1").unwrap());
        request
            .metadata_mut()
            .insert(HEADER_SIGNATURE, MetadataValue::try_from(signature.as_str()).unwrap());
        request
            .metadata_mut()
            .insert(HEADER_TIMESTAMP, MetadataValue::try_from(timestamp.as_str()).unwrap());

        let result = interceptor.call(request);
        assert!(result.is_ok());
        assert!(result
            .unwrap()
            .extensions()
            .get::<AgentContext>()
            .unwrap()
            .authenticated);
    }

    #[test]
    fn missing_metadata_key_is_unauthenticated() {
        let authenticator = authenticator_with_psk(&generate_psk_hex());
        let mut interceptor = UnaryAgentInterceptor::new(authenticator);
        let request = Request::new(());
        let result = interceptor.call(request);
        assert_eq!(result.unwrap_err().code(), tonic::Code::Unauthenticated);
    }
}
