//! # Payment Types
//!
//! Inputs and outputs of a card payment attempt.
//!
//! ## Payment State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       CardPaymentStatus                                 │
//! │                                                                         │
//! │  InitializingPayment ─────► InitializingPaymentFailed                   │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  CollectingPayment ───────► CollectingPaymentFailed                     │
//! │    │  (WaitingForInput | ShowAdditionalInfo)*                           │
//! │         ▼                                                               │
//! │  ProcessingPayment ───────► ProcessingPaymentFailed                     │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  CapturingPayment ────────► CapturingPaymentFailed                      │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  PaymentCompleted                                                       │
//! │                                                                         │
//! │  Every *Failed state may carry a PaymentData handle. Redeeming it with │
//! │  retry resumes at the failed step; the card is never charged twice.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;
use uuid::Uuid;

use crate::money::Money;
use crate::reader::{AdditionalInfoType, ReaderInputOption};

// =============================================================================
// Payment Input
// =============================================================================

/// Everything needed to charge one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentInfo {
    pub payment_description: String,
    pub order_id: i64,
    pub amount: Money,
    /// ISO 4217 code, e.g. "USD".
    pub currency: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub store_name: Option<String>,
    pub site_url: Option<String>,
    pub order_key: Option<String>,
    pub statement_descriptor: Option<String>,
    pub country_code: Option<String>,
    pub fee_amount: Option<Money>,
    /// The store sends its own receipts; the vendor should not.
    pub plugin_can_send_receipt: bool,
}

// =============================================================================
// Payment Handle
// =============================================================================

/// Opaque handle to an in-progress or failed payment attempt.
///
/// The engine keeps the protocol state (the vendor payment intent) behind
/// the handle. A handle can be redeemed once, by retry or cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentData {
    #[ts(as = "String")]
    handle: Uuid,
    order_id: i64,
}

impl PaymentData {
    /// Issues a fresh handle for an order.
    pub fn issue(order_id: i64) -> Self {
        PaymentData {
            handle: Uuid::new_v4(),
            order_id,
        }
    }

    pub fn handle(&self) -> Uuid {
        self.handle
    }

    pub fn order_id(&self) -> i64 {
        self.order_id
    }
}

// =============================================================================
// Capture Outcome
// =============================================================================

/// Result of the server-side capture call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureOutcome {
    Success,
    GenericError,
    PaymentAlreadyCaptured,
    MissingOrder,
    CaptureError,
    ServerError,
    NetworkError,
}

impl CaptureOutcome {
    /// True when the charge is settled on the backend.
    pub fn is_success(&self) -> bool {
        matches!(self, CaptureOutcome::Success | CaptureOutcome::PaymentAlreadyCaptured)
    }

    /// True when repeating the capture is safe.
    ///
    /// Capture is idempotent on the backend for transport-level failures.
    /// `MissingOrder` and `CaptureError` are final for the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureOutcome::GenericError | CaptureOutcome::ServerError | CaptureOutcome::NetworkError
        )
    }
}

impl fmt::Display for CaptureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureOutcome::Success => "SUCCESS",
            CaptureOutcome::GenericError => "GENERIC_ERROR",
            CaptureOutcome::PaymentAlreadyCaptured => "PAYMENT_ALREADY_CAPTURED",
            CaptureOutcome::MissingOrder => "MISSING_ORDER",
            CaptureOutcome::CaptureError => "CAPTURE_ERROR",
            CaptureOutcome::ServerError => "SERVER_ERROR",
            CaptureOutcome::NetworkError => "NETWORK_ERROR",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Error Taxonomy
// =============================================================================

/// Why the card network declined a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CardDeclineReason {
    Temporary,
    Fraud,
    Generic,
    InvalidAccount,
    CardNotSupported,
    CurrencyNotSupported,
    DuplicateTransaction,
    ExpiredCard,
    IncorrectPostalCode,
    InsufficientFunds,
    InvalidAmount,
    PinRequired,
    TooManyPinTries,
    TestCard,
    TestModeLiveCard,
}

/// Declines reported by the payment backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Declined {
    /// The charge is below the backend's minimum.
    AmountTooSmall,
    /// Declined with a code the engine does not know.
    Unknown,
    /// Declined for a known card-related reason.
    CardDeclined(CardDeclineReason),
}

/// Application-facing error categories for `*Failed` payment states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CardPaymentStatusErrorType {
    CardReadTimeOut,
    NoNetwork,
    Server(String),
    Generic,
    Cancelled,
    ReaderNotConnected,
    ReaderBusy,
    DeclinedByBackend(Declined),
    Capture(CaptureOutcome),
}

/// Payload of every `*Failed` payment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentFailure {
    pub error_type: CardPaymentStatusErrorType,
    /// Human-readable reason, for logs and support.
    pub reason: String,
    /// Present when `retry_collect_payment` can resume this attempt.
    pub payment_data: Option<PaymentData>,
}

impl PaymentFailure {
    pub fn new(error_type: CardPaymentStatusErrorType, reason: impl Into<String>) -> Self {
        PaymentFailure {
            error_type,
            reason: reason.into(),
            payment_data: None,
        }
    }

    pub fn with_payment_data(mut self, payment_data: PaymentData) -> Self {
        self.payment_data = Some(payment_data);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.payment_data.is_some()
    }
}

// =============================================================================
// Payment Status
// =============================================================================

/// One event of a payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum CardPaymentStatus {
    InitializingPayment,
    InitializingPaymentFailed(PaymentFailure),
    CollectingPayment,
    WaitingForInput(Vec<ReaderInputOption>),
    ShowAdditionalInfo(AdditionalInfoType),
    CollectingPaymentFailed(PaymentFailure),
    ProcessingPayment,
    ProcessingPaymentFailed(PaymentFailure),
    CapturingPayment,
    CapturingPaymentFailed(PaymentFailure),
    PaymentCompleted { payment_intent_id: String },
    /// The handle given to retry was stale, already redeemed, or unknown.
    NothingToRetry,
}

impl CardPaymentStatus {
    /// Returns true for states after which the attempt emits nothing more.
    pub fn is_terminal(&self) -> bool {
        self.failure().is_some()
            || matches!(
                self,
                CardPaymentStatus::PaymentCompleted { .. } | CardPaymentStatus::NothingToRetry
            )
    }

    /// Returns the failure payload of a `*Failed` state.
    pub fn failure(&self) -> Option<&PaymentFailure> {
        match self {
            CardPaymentStatus::InitializingPaymentFailed(f)
            | CardPaymentStatus::CollectingPaymentFailed(f)
            | CardPaymentStatus::ProcessingPaymentFailed(f)
            | CardPaymentStatus::CapturingPaymentFailed(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_outcome_policy() {
        assert!(CaptureOutcome::PaymentAlreadyCaptured.is_success());
        assert!(CaptureOutcome::Success.is_success());
        assert!(CaptureOutcome::NetworkError.is_retryable());
        assert!(CaptureOutcome::ServerError.is_retryable());
        assert!(!CaptureOutcome::MissingOrder.is_retryable());
        assert!(!CaptureOutcome::CaptureError.is_retryable());
        assert!(!CaptureOutcome::MissingOrder.is_success());
    }

    #[test]
    fn test_handles_are_unique_per_issue() {
        let a = PaymentData::issue(7);
        let b = PaymentData::issue(7);
        assert_ne!(a, b);
        assert_eq!(a.order_id(), 7);
    }

    #[test]
    fn test_terminal_states() {
        let failure = PaymentFailure::new(CardPaymentStatusErrorType::Generic, "boom");
        assert!(CardPaymentStatus::ProcessingPaymentFailed(failure.clone()).is_terminal());
        assert!(CardPaymentStatus::NothingToRetry.is_terminal());
        assert!(!CardPaymentStatus::CollectingPayment.is_terminal());
        assert!(!CardPaymentStatus::WaitingForInput(vec![ReaderInputOption::Tap]).is_terminal());
        assert!(!failure.is_retryable());
    }

    #[test]
    fn test_status_json_shape() {
        let json = serde_json::to_value(CardPaymentStatus::CollectingPaymentFailed(
            PaymentFailure::new(
                CardPaymentStatusErrorType::DeclinedByBackend(Declined::CardDeclined(
                    CardDeclineReason::InsufficientFunds,
                )),
                "declined: insufficient funds",
            ),
        ))
        .unwrap();
        assert_eq!(json["state"], "collecting_payment_failed");
        assert_eq!(json["data"]["error_type"]["kind"], "declined_by_backend");
        assert_eq!(json["data"]["error_type"]["detail"]["reason"], "insufficient_funds");
    }
}
