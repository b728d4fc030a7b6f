//! Error types and HTTP error response handling.
//!
//! This module defines every error the payment engine can surface and how each one
//! is converted into an HTTP response with a stable error code and JSON body.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::providers::{ProviderError, ProviderErrorCode};

/// Application-wide error type.
///
/// # Error Categories
///
/// - **Domain/state errors**: illegal transitions and race guards. Always surfaced.
/// - **Policy errors**: expected business outcomes from the risk gate or store status.
/// - **Provider errors**: normalized provider failures (see [`ProviderErrorCode`]).
/// - **Integrity errors**: webhook payloads that cannot be trusted or matched.
/// - **Infrastructure errors**: database and internal failures (details hidden from clients).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// API key is missing, invalid, or inactive.
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Authenticated caller lacks the admin role.
    #[error("Admin role required")]
    Forbidden,

    /// Request body or parameters are invalid.
    #[error("Invalid request")]
    InvalidRequest(String),

    // Domain / state errors
    #[error("Payment cannot move from {from} to {to}")]
    InvalidPaymentTransition { from: String, to: String },

    #[error("Refund cannot move from {from} to {to}")]
    InvalidRefundTransition { from: String, to: String },

    #[error("Payment not found")]
    PaymentNotFound,

    #[error("Refund not found")]
    RefundNotFound,

    #[error("Order not found")]
    OrderNotFound,

    #[error("Order is not payable in status {0}")]
    OrderNotPayable(String),

    #[error("A live payment already exists for this order")]
    PaymentAlreadyExists,

    #[error("Another confirmation is in progress for this payment")]
    PaymentInProgress,

    #[error("Payment has reached its retry limit")]
    MaxRetriesExceeded,

    #[error("Payment was retried recently, try again after {retry_after}")]
    RetryCooldownActive { retry_after: DateTime<Utc> },

    #[error("Payment failed with non-retryable code {0}")]
    PaymentNotRetryable(String),

    #[error("Payment in status {0} cannot be refunded")]
    PaymentNotRefundable(String),

    #[error("Refund amount exceeds the refundable balance of the payment")]
    RefundExceedsPayment,

    #[error("Webhook event not found")]
    WebhookEventNotFound,

    #[error("Dead letter not found")]
    DeadLetterNotFound,

    // Policy errors
    #[error("Payment requires manual review")]
    PaymentRequiresManualReview,

    #[error("Payments are locked for this customer by risk policy")]
    PaymentLockedByRiskPolicy,

    #[error("Store is offline; only wallet payments are accepted")]
    PaymentDisabledOffline,

    // Provider errors
    #[error("Unsupported payment provider: {0}")]
    UnsupportedProvider(String),

    #[error("Provider error {}: {}", .0.code, .0.message)]
    Provider(#[from] ProviderError),

    // Integrity errors
    #[error("Webhook signature is invalid")]
    WebhookSignatureInvalid,

    #[error("Event amount or currency does not match the payment")]
    PaymentAmountMismatch,

    #[error("Provider reference is not known")]
    UnknownProviderReference,

    #[error("Webhook payload is malformed: {0}")]
    MalformedWebhook(String),

    // Idempotency errors
    #[error("Idempotency-Key header is required")]
    MissingIdempotencyKey,

    #[error("A request with this Idempotency-Key is still being processed")]
    IdempotencyKeyInUse,

    #[error("Idempotency-Key was already used with a different payload")]
    IdempotencyKeyReused,

    /// Invariant violated inside the engine. Never expected in normal operation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "INTERNAL_ERROR",
            AppError::InvalidApiKey => "INVALID_API_KEY",
            AppError::Forbidden => "FORBIDDEN",
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::InvalidPaymentTransition { .. } => "INVALID_PAYMENT_TRANSITION",
            AppError::InvalidRefundTransition { .. } => "INVALID_REFUND_TRANSITION",
            AppError::PaymentNotFound => "PAYMENT_NOT_FOUND",
            AppError::RefundNotFound => "REFUND_NOT_FOUND",
            AppError::OrderNotFound => "ORDER_NOT_FOUND",
            AppError::OrderNotPayable(_) => "ORDER_NOT_PAYABLE",
            AppError::PaymentAlreadyExists => "PAYMENT_ALREADY_EXISTS",
            AppError::PaymentInProgress => "PAYMENT_IN_PROGRESS",
            AppError::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            AppError::RetryCooldownActive { .. } => "RETRY_COOLDOWN_ACTIVE",
            AppError::PaymentNotRetryable(_) => "PAYMENT_NOT_RETRYABLE",
            AppError::PaymentNotRefundable(_) => "PAYMENT_NOT_REFUNDABLE",
            AppError::RefundExceedsPayment => "REFUND_EXCEEDS_PAYMENT",
            AppError::WebhookEventNotFound => "WEBHOOK_EVENT_NOT_FOUND",
            AppError::DeadLetterNotFound => "DEAD_LETTER_NOT_FOUND",
            AppError::PaymentRequiresManualReview => "PAYMENT_REQUIRES_MANUAL_REVIEW",
            AppError::PaymentLockedByRiskPolicy => "PAYMENT_LOCKED_BY_RISK_POLICY",
            AppError::PaymentDisabledOffline => "PAYMENT_DISABLED_OFFLINE",
            AppError::UnsupportedProvider(_) => "UNSUPPORTED_PROVIDER",
            AppError::Provider(err) => err.code.as_str(),
            AppError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            AppError::PaymentAmountMismatch => "PAYMENT_AMOUNT_MISMATCH",
            AppError::UnknownProviderReference => "UNKNOWN_PROVIDER_REFERENCE",
            AppError::MalformedWebhook(_) => "MALFORMED_WEBHOOK",
            AppError::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            AppError::IdempotencyKeyInUse => "IDEMPOTENCY_KEY_IN_USE",
            AppError::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Integrity errors mean a webhook cannot be trusted or matched; redelivery never fixes them.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            AppError::WebhookSignatureInvalid
                | AppError::PaymentAmountMismatch
                | AppError::UnknownProviderReference
                | AppError::MalformedWebhook(_)
        )
    }

    /// Policy errors are expected business outcomes, not system failures.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            AppError::PaymentRequiresManualReview
                | AppError::PaymentLockedByRiskPolicy
                | AppError::PaymentDisabledOffline
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidApiKey | AppError::WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::InvalidRequest(_)
            | AppError::MissingIdempotencyKey
            | AppError::MalformedWebhook(_)
            | AppError::PaymentAmountMismatch
            | AppError::UnknownProviderReference
            | AppError::UnsupportedProvider(_) => StatusCode::BAD_REQUEST,
            AppError::PaymentNotFound
            | AppError::RefundNotFound
            | AppError::OrderNotFound
            | AppError::WebhookEventNotFound
            | AppError::DeadLetterNotFound => StatusCode::NOT_FOUND,
            AppError::InvalidPaymentTransition { .. }
            | AppError::InvalidRefundTransition { .. }
            | AppError::PaymentAlreadyExists
            | AppError::PaymentInProgress
            | AppError::IdempotencyKeyInUse
            | AppError::OrderNotPayable(_) => StatusCode::CONFLICT,
            AppError::MaxRetriesExceeded
            | AppError::PaymentNotRetryable(_)
            | AppError::PaymentNotRefundable(_)
            | AppError::RefundExceedsPayment
            | AppError::PaymentRequiresManualReview
            | AppError::PaymentDisabledOffline
            | AppError::IdempotencyKeyReused => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::RetryCooldownActive { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::PaymentLockedByRiskPolicy => StatusCode::LOCKED,
            AppError::Provider(err) => match err.code {
                ProviderErrorCode::ProviderTimeout => StatusCode::GATEWAY_TIMEOUT,
                ProviderErrorCode::ProviderUnavailable => StatusCode::BAD_GATEWAY,
                _ => StatusCode::PAYMENT_REQUIRED,
            },
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "PAYMENT_NOT_FOUND",
///     "message": "Payment not found"
///   }
/// }
/// ```
///
/// Database and internal errors hide their details from the client.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Database(err) => {
                tracing::error!(error = %err, "database error");
                "An internal error occurred".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                "An internal error occurred".to_string()
            }
            AppError::InvalidRequest(msg) => msg.clone(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_keep_their_vocabulary_code() {
        let err: AppError = ProviderError::new(ProviderErrorCode::FraudSuspected, "flagged").into();
        assert_eq!(err.code(), "FRAUD_SUSPECTED");
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn transient_provider_errors_map_to_gateway_statuses() {
        let timeout: AppError = ProviderError::new(ProviderErrorCode::ProviderTimeout, "slow").into();
        let down: AppError = ProviderError::new(ProviderErrorCode::ProviderUnavailable, "down").into();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(down.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn integrity_and_policy_classification() {
        assert!(AppError::PaymentAmountMismatch.is_integrity());
        assert!(AppError::UnknownProviderReference.is_integrity());
        assert!(!AppError::PaymentNotFound.is_integrity());
        assert!(AppError::PaymentLockedByRiskPolicy.is_policy());
        assert!(!AppError::MaxRetriesExceeded.is_policy());
    }
}
