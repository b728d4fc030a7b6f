//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (JSON body, URL params, etc.)
//! 2. Calls the service that owns the operation
//! 3. Returns HTTP response (JSON, status code)

/// Operations endpoints for admin keys
pub mod admin;
/// Service health endpoint
pub mod health;
/// Payment command endpoints
pub mod payments;
/// Refund endpoints
pub mod refunds;
/// Inbound provider webhooks
pub mod webhooks;
