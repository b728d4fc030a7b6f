//! Business logic services.
//!
//! Services contain core business logic separated from HTTP handlers.
//! They own the units of work, call providers outside any transaction,
//! and feed risk signals.

pub mod events;
pub mod idempotency_service;
pub mod payment_service;
pub mod reconciliation_service;
pub mod refund_service;
pub mod risk;
pub mod webhook_service;
