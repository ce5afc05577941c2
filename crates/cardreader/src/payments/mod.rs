//! # Payments
//!
//! Drives one card payment attempt end to end and keeps enough state behind
//! each [`PaymentData`](cardreader_core::PaymentData) handle to retry or
//! cancel it safely.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  PaymentManager                                                         │
//! │                                                                         │
//! │   CreatePaymentAction ─► CollectPaymentAction ─► ProcessPaymentAction   │
//! │                                                         │               │
//! │                                                         ▼               │
//! │                                              PaymentCapturer (backend)  │
//! │                                                                         │
//! │   sessions: handle ─► { intent, stage, cancel token, task }            │
//! │                                                                         │
//! │  RefundManager                                                          │
//! │                                                                         │
//! │   CollectRefundAction ─► ProcessRefundAction                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod actions;
pub mod manager;
pub mod refund;

use async_trait::async_trait;

use cardreader_core::CaptureOutcome;

pub use manager::{PaymentAttempt, PaymentManager};
pub use refund::{RefundAttempt, RefundManager};

/// Backend collaborator that captures a processed payment against an order.
///
/// Outcomes pass through to the payment sequence unchanged.
#[async_trait]
pub trait PaymentCapturer: Send + Sync {
    async fn capture_payment_intent(&self, order_id: i64, payment_intent_id: &str) -> CaptureOutcome;
}
