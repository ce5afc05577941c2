//! # Payment Error Mapper
//!
//! Pure translation from vendor failures to the application's payment error
//! taxonomy. No state, no side effects.
//!
//! ## Mapping Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  TerminalErrorCode            →  CardPaymentStatusErrorType             │
//! │  ───────────────────────────     ────────────────────────────────────   │
//! │  CardReadTimedOut             →  CardReadTimeOut                        │
//! │  ApiConnectionError           →  NoNetwork                              │
//! │  ApiError                     →  Server(message)                        │
//! │  DeclinedByApi + decline_code →  DeclinedByBackend(decline table)       │
//! │  Canceled                     →  Cancelled                              │
//! │  NotConnected / Disconnected  →  ReaderNotConnected                     │
//! │  ReaderBusy                   →  ReaderBusy                             │
//! │  anything else                →  Generic                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Refunds use a smaller taxonomy: `ApiConnectionError` → `NoNetwork`,
//! `Canceled` → `Cancelled`, `DeclinedByApi` → the same decline table, and
//! `Generic` for everything else.

use crate::payment::{
    CaptureOutcome, CardDeclineReason, CardPaymentStatusErrorType, Declined, PaymentFailure,
};
use crate::refund::{RefundFailure, RefundParams, RefundStatusErrorType};
use crate::vendor::{TerminalError, TerminalErrorCode};

/// Backend `code` reported when the charge is below the minimum.
const AMOUNT_TOO_SMALL_CODE: &str = "amount_too_small";

/// Maps a failed vendor call onto an application failure (without a handle).
pub fn map_terminal_error(error: &TerminalError) -> PaymentFailure {
    match &error.code {
        TerminalErrorCode::CardReadTimedOut => PaymentFailure::new(
            CardPaymentStatusErrorType::CardReadTimeOut,
            "card read timed out",
        ),
        TerminalErrorCode::ApiConnectionError => {
            PaymentFailure::new(CardPaymentStatusErrorType::NoNetwork, "no network connection")
        }
        TerminalErrorCode::ApiError => {
            let message = error
                .api_error
                .as_ref()
                .and_then(|api| api.message.clone())
                .unwrap_or_else(|| error.message.clone());
            PaymentFailure::new(
                CardPaymentStatusErrorType::Server(message.clone()),
                format!("server error: {}", message),
            )
        }
        TerminalErrorCode::DeclinedByApi => map_decline(error),
        TerminalErrorCode::Canceled => {
            PaymentFailure::new(CardPaymentStatusErrorType::Cancelled, "payment cancelled")
        }
        TerminalErrorCode::NotConnectedToReader | TerminalErrorCode::ReaderDisconnected => {
            PaymentFailure::new(
                CardPaymentStatusErrorType::ReaderNotConnected,
                "reader not connected",
            )
        }
        TerminalErrorCode::ReaderBusy => {
            PaymentFailure::new(CardPaymentStatusErrorType::ReaderBusy, "reader busy")
        }
        TerminalErrorCode::RequestTimedOut
        | TerminalErrorCode::UpdateBatteryLow
        | TerminalErrorCode::UpdateFailed
        | TerminalErrorCode::Other(_) => {
            PaymentFailure::new(CardPaymentStatusErrorType::Generic, error.message.clone())
        }
    }
}

/// Maps a non-success capture outcome onto an application failure.
pub fn map_capture_outcome(outcome: CaptureOutcome) -> PaymentFailure {
    let reason = match outcome {
        CaptureOutcome::Success | CaptureOutcome::PaymentAlreadyCaptured => "payment captured",
        CaptureOutcome::GenericError => "capture failed",
        CaptureOutcome::MissingOrder => "order not found for capture",
        CaptureOutcome::CaptureError => "backend refused to capture the payment",
        CaptureOutcome::ServerError => "server error during capture",
        CaptureOutcome::NetworkError => "network error during capture",
    };
    PaymentFailure::new(CardPaymentStatusErrorType::Capture(outcome), reason)
}

fn map_decline(error: &TerminalError) -> PaymentFailure {
    let api_error = error.api_error.as_ref();
    if api_error.and_then(|api| api.code.as_deref()) == Some(AMOUNT_TOO_SMALL_CODE) {
        return PaymentFailure::new(
            CardPaymentStatusErrorType::DeclinedByBackend(Declined::AmountTooSmall),
            "declined: amount too small",
        );
    }

    let decline_code = api_error.and_then(|api| api.decline_code.as_deref());
    PaymentFailure::new(
        CardPaymentStatusErrorType::DeclinedByBackend(map_decline_code(decline_code)),
        decline_reason(decline_code),
    )
}

fn decline_reason(decline_code: Option<&str>) -> String {
    match decline_code {
        Some(code) => format!("declined: {}", code.replace('_', " ")),
        None => "declined".to_string(),
    }
}

/// Maps a failed refund call onto a refund failure carrying `params`.
pub fn map_refund_error(params: &RefundParams, error: &TerminalError) -> RefundFailure {
    let (error_type, reason) = match &error.code {
        TerminalErrorCode::DeclinedByApi => {
            let decline_code = error
                .api_error
                .as_ref()
                .and_then(|api| api.decline_code.as_deref());
            (
                RefundStatusErrorType::DeclinedByBackend(map_decline_code(decline_code)),
                decline_reason(decline_code),
            )
        }
        TerminalErrorCode::ApiConnectionError => {
            (RefundStatusErrorType::NoNetwork, "no network connection".to_string())
        }
        TerminalErrorCode::Canceled => {
            (RefundStatusErrorType::Cancelled, "refund cancelled".to_string())
        }
        _ => (RefundStatusErrorType::Generic, error.message.clone()),
    };
    RefundFailure::new(error_type, reason, params.clone())
}

/// Maps a backend decline code onto a decline category.
///
/// Unknown or missing codes map to [`Declined::Unknown`].
pub fn map_decline_code(decline_code: Option<&str>) -> Declined {
    use CardDeclineReason::*;

    let reason = match decline_code.unwrap_or_default() {
        "approve_with_id" | "issuer_not_available" | "processing_error" | "reenter_transaction"
        | "try_again_later" => Temporary,

        "call_issuer"
        | "card_velocity_exceeded"
        | "do_not_honor"
        | "do_not_try_again"
        | "fraudulent"
        | "lost_card"
        | "merchant_blacklist"
        | "pickup_card"
        | "restricted_card"
        | "revocation_of_all_authorizations"
        | "revocation_of_authorization"
        | "security_violation"
        | "stolen_card"
        | "stop_payment_order" => Fraud,

        "generic_decline"
        | "no_action_taken"
        | "not_permitted"
        | "service_not_allowed"
        | "transaction_not_allowed" => Generic,

        "insufficient_funds" | "withdrawal_count_limit_exceeded" => InsufficientFunds,
        "invalid_account" | "new_account_information_available" => InvalidAccount,
        "invalid_pin" | "offline_pin_required" | "online_or_offline_pin_required" => PinRequired,
        "pin_try_exceeded" => TooManyPinTries,
        "card_not_supported" => CardNotSupported,
        "currency_not_supported" => CurrencyNotSupported,
        "duplicate_transaction" => DuplicateTransaction,
        "expired_card" => ExpiredCard,
        "incorrect_zip" => IncorrectPostalCode,
        "invalid_amount" => InvalidAmount,
        "test_mode_live_card" => TestModeLiveCard,
        "testmode_decline" => TestCard,
        _ => return Declined::Unknown,
    };
    Declined::CardDeclined(reason)
}
