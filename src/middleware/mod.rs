//! HTTP middleware components.
//!
//! Middleware are functions that run before route handlers.
//! They can:
//! - Authenticate requests
//! - Replay stored command responses
//! - Short-circuit requests (reject unauthorized)

/// API key authentication middleware
pub mod auth;
/// Idempotency-Key enforcement for money-moving commands
pub mod idempotency;
