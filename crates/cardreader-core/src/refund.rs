//! # Interac Refund Types
//!
//! Interac charges can only be refunded with the card present: the customer
//! taps or inserts the same card again and the reader sends the refund to
//! the card network.
//!
//! ## Refund Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      CardInteracRefundStatus                            │
//! │                                                                         │
//! │  InitializingInteracRefund                                              │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  CollectingInteracRefund ──────┐                                        │
//! │         │                      │                                        │
//! │         ▼                      ├──► InteracRefundFailure(type, params)  │
//! │  ProcessingInteracRefund ──────┘                                        │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  InteracRefundSuccess                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failure carries the original [`RefundParams`] so the caller can start
//! the refund again. There is no resumable handle: a refund that failed
//! never reached the card network.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::Money;
use crate::payment::Declined;

/// The charge to refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RefundParams {
    /// Vendor charge id of the original Interac payment.
    pub charge_id: String,
    pub amount: Money,
    /// ISO 4217 code, e.g. "CAD".
    pub currency: String,
}

/// Application-facing error categories for a failed refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RefundStatusErrorType {
    NoNetwork,
    Cancelled,
    Generic,
    DeclinedByBackend(Declined),
}

/// Payload of [`CardInteracRefundStatus::InteracRefundFailure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RefundFailure {
    pub error_type: RefundStatusErrorType,
    pub reason: String,
    pub refund_params: RefundParams,
}

impl RefundFailure {
    pub fn new(
        error_type: RefundStatusErrorType,
        reason: impl Into<String>,
        refund_params: RefundParams,
    ) -> Self {
        RefundFailure {
            error_type,
            reason: reason.into(),
            refund_params,
        }
    }
}

/// One event of an Interac refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum CardInteracRefundStatus {
    InitializingInteracRefund,
    CollectingInteracRefund,
    ProcessingInteracRefund,
    InteracRefundSuccess,
    InteracRefundFailure(RefundFailure),
}

impl CardInteracRefundStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CardInteracRefundStatus::InteracRefundSuccess
                | CardInteracRefundStatus::InteracRefundFailure(_)
        )
    }

    pub fn failure(&self) -> Option<&RefundFailure> {
        match self {
            CardInteracRefundStatus::InteracRefundFailure(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::CardDeclineReason;

    fn params() -> RefundParams {
        RefundParams {
            charge_id: "ch_1".into(),
            amount: Money::from_minor_units(1000),
            currency: "CAD".into(),
        }
    }

    #[test]
    fn test_only_success_and_failure_are_terminal() {
        assert!(!CardInteracRefundStatus::CollectingInteracRefund.is_terminal());
        assert!(CardInteracRefundStatus::InteracRefundSuccess.is_terminal());

        let failed = CardInteracRefundStatus::InteracRefundFailure(RefundFailure::new(
            RefundStatusErrorType::NoNetwork,
            "no network connection",
            params(),
        ));
        assert!(failed.is_terminal());
        assert_eq!(failed.failure().map(|f| &f.refund_params), Some(&params()));
    }

    #[test]
    fn test_failure_wire_shape() {
        let failed = CardInteracRefundStatus::InteracRefundFailure(RefundFailure::new(
            RefundStatusErrorType::DeclinedByBackend(Declined::CardDeclined(
                CardDeclineReason::ExpiredCard,
            )),
            "declined: expired card",
            params(),
        ));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["state"], "interac_refund_failure");
        assert_eq!(json["data"]["error_type"]["kind"], "declined_by_backend");
        assert_eq!(json["data"]["refund_params"]["charge_id"], "ch_1");
    }
}
