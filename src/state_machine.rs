//! Transition tables for the Payment and Refund lifecycles.
//!
//! These checks are pure. Stores call them inside the same transaction that re-reads the
//! current status and writes the new one, so two racing callers cannot both apply a move:
//! the loser re-reads the winner's status and fails the guard.

use crate::error::AppError;
use crate::models::payment::PaymentStatus;
use crate::models::refund::RefundStatus;

/// Legal lifecycle moves out of a payment status.
///
/// ```text
/// PENDING            -> PAID | FAILED | CANCELLED
/// FAILED             -> PENDING | RETRYING
/// RETRYING           -> PAID | FAILED
/// PAID               -> PARTIALLY_REFUNDED | REFUNDED
/// PARTIALLY_REFUNDED -> REFUNDED
/// REFUNDED, CANCELLED: terminal
/// ```
pub fn payment_targets(from: PaymentStatus) -> &'static [PaymentStatus] {
    use PaymentStatus::*;
    match from {
        Pending => &[Paid, Failed, Cancelled],
        Failed => &[Pending, Retrying],
        Retrying => &[Paid, Failed],
        Paid => &[PartiallyRefunded, Refunded],
        PartiallyRefunded => &[Refunded],
        Refunded | Cancelled => &[],
    }
}

/// Corrections an operator may force. Kept apart from the lifecycle table so that
/// no automated path can reach these moves.
pub fn override_targets(from: PaymentStatus) -> &'static [PaymentStatus] {
    use PaymentStatus::*;
    match from {
        Failed => &[Paid, Cancelled],
        Cancelled => &[Paid],
        Paid => &[Failed],
        _ => &[],
    }
}

pub fn refund_targets(from: RefundStatus) -> &'static [RefundStatus] {
    use RefundStatus::*;
    match from {
        Requested => &[Processing, Cancelled],
        Processing => &[Completed, Failed],
        Completed | Failed | Cancelled => &[],
    }
}

pub fn assert_payment_transition(from: PaymentStatus, to: PaymentStatus) -> Result<(), AppError> {
    if payment_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(AppError::InvalidPaymentTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Lifecycle moves are always allowed as overrides too.
pub fn assert_payment_override(from: PaymentStatus, to: PaymentStatus) -> Result<(), AppError> {
    if override_targets(from).contains(&to) {
        return Ok(());
    }
    assert_payment_transition(from, to)
}

pub fn assert_refund_transition(from: RefundStatus, to: RefundStatus) -> Result<(), AppError> {
    if refund_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(AppError::InvalidRefundTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
