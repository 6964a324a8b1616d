//! Access-control plane mediating HTTP operators and gRPC edge agents: a
//! credential hasher, rate limiter, input validator, session store, user
//! authenticator, OIDC bridge, agent authenticator, permission oracle, and
//! the HTTP/gRPC gate middleware that binds them to a transport.

pub mod agent_auth;
pub mod app;
pub mod config;
pub mod error;
pub mod grpc;
pub mod hasher;
pub mod middleware;
pub mod oidc;
pub mod permissions;
pub mod rate_limit;
pub mod session;
pub mod user_auth;
pub mod validation;

pub use error::GatewayError;
pub use permissions::Role;
pub use session::Identity;
