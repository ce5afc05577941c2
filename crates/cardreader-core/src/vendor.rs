//! # Vendor Terminal Vocabulary
//!
//! Plain-data mirror of what the vendor terminal SDK hands back: payment
//! intents, their statuses, and the error values its calls fail with.
//!
//! Vendor failures are values, not panics or unwinding errors. Every
//! transport call returns `Result<T, TerminalError>` and the managers turn
//! the error into a terminal state of the current event sequence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::money::Money;
use crate::payment::PaymentInfo;

// =============================================================================
// Payment Intent
// =============================================================================

/// Vendor-side status of a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentIntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresCapture,
    Processing,
    Succeeded,
    Canceled,
}

impl fmt::Display for PaymentIntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentIntentStatus::RequiresPaymentMethod => "REQUIRES_PAYMENT_METHOD",
            PaymentIntentStatus::RequiresConfirmation => "REQUIRES_CONFIRMATION",
            PaymentIntentStatus::RequiresCapture => "REQUIRES_CAPTURE",
            PaymentIntentStatus::Processing => "PROCESSING",
            PaymentIntentStatus::Succeeded => "SUCCEEDED",
            PaymentIntentStatus::Canceled => "CANCELED",
        };
        write!(f, "{}", name)
    }
}

/// The vendor-side handle for one payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: PaymentIntentStatus,
    pub amount: Money,
    pub currency: String,
}

impl PaymentIntent {
    /// Returns a copy with a different status.
    pub fn with_status(&self, status: PaymentIntentStatus) -> Self {
        PaymentIntent {
            status,
            ..self.clone()
        }
    }
}

/// Parameters for creating a payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentParams {
    pub amount: Money,
    pub currency: String,
    pub description: String,
    pub statement_descriptor: Option<String>,
    pub receipt_email: Option<String>,
    pub application_fee: Option<Money>,
    pub metadata: BTreeMap<String, String>,
}

impl From<&PaymentInfo> for PaymentIntentParams {
    fn from(info: &PaymentInfo) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("order_id".to_string(), info.order_id.to_string());
        let optional = [
            ("order_key", &info.order_key),
            ("customer_name", &info.customer_name),
            ("store_name", &info.store_name),
            ("site_url", &info.site_url),
            ("country_code", &info.country_code),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value.clone());
            }
        }

        PaymentIntentParams {
            amount: info.amount,
            currency: info.currency.to_lowercase(),
            description: info.payment_description.clone(),
            statement_descriptor: info.statement_descriptor.clone(),
            // Only ask the vendor to email a receipt when the store cannot
            receipt_email: if info.plugin_can_send_receipt {
                None
            } else {
                info.customer_email.clone()
            },
            application_fee: info.fee_amount,
            metadata,
        }
    }
}

// =============================================================================
// Refund
// =============================================================================

/// Vendor-side status of a processed refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Succeeded,
    Pending,
    Failed,
}

/// A refund the vendor has sent to the card network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub charge_id: String,
    pub amount: Money,
    pub currency: String,
    pub status: RefundStatus,
}

// =============================================================================
// Terminal Errors
// =============================================================================

/// Error codes the vendor terminal reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalErrorCode {
    /// The customer did not present a card in time.
    CardReadTimedOut,
    /// The vendor backend could not be reached.
    ApiConnectionError,
    /// The vendor backend rejected the request.
    ApiError,
    /// The card network declined the charge.
    DeclinedByApi,
    /// The operation was cancelled (acknowledgement of a cancel request).
    Canceled,
    /// The transport did not answer within its bound.
    RequestTimedOut,
    /// No reader is attached.
    NotConnectedToReader,
    /// The reader is busy with another operation.
    ReaderBusy,
    /// The reader link went away mid-operation.
    ReaderDisconnected,
    /// A firmware install was refused because of low battery.
    UpdateBatteryLow,
    /// A firmware install failed on the reader.
    UpdateFailed,
    /// Anything the engine does not recognise.
    Other(String),
}

impl fmt::Display for TerminalErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalErrorCode::CardReadTimedOut => write!(f, "CARD_READ_TIMED_OUT"),
            TerminalErrorCode::ApiConnectionError => write!(f, "API_CONNECTION_ERROR"),
            TerminalErrorCode::ApiError => write!(f, "API_ERROR"),
            TerminalErrorCode::DeclinedByApi => write!(f, "DECLINED_BY_API"),
            TerminalErrorCode::Canceled => write!(f, "CANCELED"),
            TerminalErrorCode::RequestTimedOut => write!(f, "REQUEST_TIMED_OUT"),
            TerminalErrorCode::NotConnectedToReader => write!(f, "NOT_CONNECTED_TO_READER"),
            TerminalErrorCode::ReaderBusy => write!(f, "READER_BUSY"),
            TerminalErrorCode::ReaderDisconnected => write!(f, "READER_DISCONNECTED"),
            TerminalErrorCode::UpdateBatteryLow => write!(f, "UPDATE_BATTERY_LOW"),
            TerminalErrorCode::UpdateFailed => write!(f, "UPDATE_FAILED"),
            TerminalErrorCode::Other(code) => write!(f, "{}", code),
        }
    }
}

/// Backend error details attached to API failures and declines.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiError {
    pub code: Option<String>,
    pub decline_code: Option<String>,
    pub message: Option<String>,
}

/// A failed vendor call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct TerminalError {
    pub code: TerminalErrorCode,
    pub message: String,
    pub api_error: Option<ApiError>,
    /// The intent as the vendor saw it when the call failed.
    pub payment_intent: Option<PaymentIntent>,
}

impl TerminalError {
    pub fn new(code: TerminalErrorCode, message: impl Into<String>) -> Self {
        TerminalError {
            code,
            message: message.into(),
            api_error: None,
            payment_intent: None,
        }
    }

    /// A decline carrying the backend decline code.
    pub fn declined(decline_code: impl Into<String>) -> Self {
        let decline_code = decline_code.into();
        TerminalError::new(TerminalErrorCode::DeclinedByApi, "Your card was declined")
            .with_api_error(ApiError {
                code: Some("card_declined".to_string()),
                decline_code: Some(decline_code),
                message: None,
            })
    }

    /// The error the transport wrapper reports when a call exceeds its bound.
    pub fn timed_out(step: &str, limit_secs: u64) -> Self {
        TerminalError::new(
            TerminalErrorCode::RequestTimedOut,
            format!("{} did not complete within {}s", step, limit_secs),
        )
    }

    /// Cancellation acknowledgement.
    pub fn canceled() -> Self {
        TerminalError::new(TerminalErrorCode::Canceled, "Operation canceled")
    }

    pub fn with_api_error(mut self, api_error: ApiError) -> Self {
        self.api_error = Some(api_error);
        self
    }

    pub fn with_payment_intent(mut self, intent: PaymentIntent) -> Self {
        self.payment_intent = Some(intent);
        self
    }

    /// Returns true if this error acknowledges a cancel request.
    pub fn is_cancellation(&self) -> bool {
        self.code == TerminalErrorCode::Canceled
    }
}
