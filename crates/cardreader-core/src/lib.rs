//! # cardreader-core: Pure Domain Logic for the Card Reader Engine
//!
//! This crate holds every type that crosses a component boundary of the card
//! reader engine, plus the pure functions that interpret them. It has zero
//! I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Card Reader Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Payment / Settings Screens                      │   │
//! │  │     Connect ──► Collect Payment ──► Receipt ──► Update Reader   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ observable streams                     │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                cardreader (async engine)                        │   │
//! │  │   CardReaderManager, ConnectionManager, PaymentManager, ...    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ cardreader-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────────┐  │   │
//! │  │   │  reader  │ │ payment  │ │ software │ │  error_mapper    │  │   │
//! │  │   │  status  │ │ statuses │ │  update  │ │  vendor → app    │  │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────────────┘  │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐                       │   │
//! │  │   │  vendor  │ │  money   │ │validation│                       │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘                       │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO BLUETOOTH • NO NETWORK • PURE FUNCTIONS          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`reader`] - Readers, connection status, discovery events, battery, messages
//! - [`payment`] - Payment inputs, payment states, capture outcomes, error taxonomy
//! - [`refund`] - Interac refund inputs, states and error taxonomy
//! - [`update`] - Software update availability and install status
//! - [`vendor`] - Vocabulary of the vendor terminal (payment intents, error codes)
//! - [`error_mapper`] - Vendor error → application error taxonomy
//! - [`money`] - Integer minor-unit amounts with exact decimal parsing
//! - [`validation`] - Payment input validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use cardreader_core::money::Money;
//!
//! // Amounts arrive as decimal strings and are rounded half-up to cents
//! let amount: Money = "1.005".parse().unwrap();
//! assert_eq!(amount.minor_units(), 101);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod error_mapper;
pub mod money;
pub mod payment;
pub mod reader;
pub mod refund;
pub mod update;
pub mod validation;
pub mod vendor;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, ValidationError};
pub use money::Money;
pub use payment::*;
pub use reader::*;
pub use refund::*;
pub use update::*;
pub use vendor::*;
