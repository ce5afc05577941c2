//! # Error Types
//!
//! Domain-specific error types for cardreader-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  cardreader-core errors (this file)                                    │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Payment input validation failures              │
//! │                                                                         │
//! │  cardreader errors (separate crate)                                    │
//! │  └── ReaderError      - Engine, config and connection failures         │
//! │                                                                         │
//! │  Vendor failures are NOT errors here: they travel as TerminalError     │
//! │  values and end up as *Failed payment states.                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The amount string could not be turned into minor units.
    #[error("Invalid amount '{input}': {reason}")]
    InvalidAmount { input: String, reason: String },

    /// A payment handle did not belong to the given order.
    #[error("Payment handle does not belong to order {order_id}")]
    HandleOrderMismatch { order_id: i64 },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These are raised before a payment intent is created, so a rejected
/// payment never reaches the reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value is below the minimum allowed for its context.
    #[error("{field} must be at least {minimum}")]
    BelowMinimum { field: String, minimum: String },

    /// Invalid format (e.g., malformed currency code or amount).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    /// Returns true when the error means the charge is too small to process.
    pub fn is_amount_too_small(&self) -> bool {
        matches!(self, ValidationError::BelowMinimum { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
