//! # cardreader: Card Reader Engine
//!
//! This crate drives a physical card reader through the vendor terminal SDK:
//! discovery, connection, in-person payments, Interac refunds and firmware
//! updates.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Card Reader Engine                              │
//! │                                                                         │
//! │                      ┌──────────────────────┐                           │
//! │                      │  CardReaderManager   │ ◄── UI / view models      │
//! │                      │  (façade + gate)     │                           │
//! │                      └──────────┬───────────┘                           │
//! │            ┌────────────────────┼────────────────────┐                  │
//! │            ▼                    ▼                    ▼                  │
//! │   ┌────────────────┐  ┌──────────────────┐  ┌──────────────────┐        │
//! │   │ Connection     │  │ PaymentManager   │  │ SoftwareUpdate   │        │
//! │   │ Manager        │  │ create → collect │  │ Manager          │        │
//! │   │ + discovery    │  │ → process →      │  │ check / install  │        │
//! │   │                │  │ capture          │  │                  │        │
//! │   └───────┬────────┘  └────────┬─────────┘  └────────┬─────────┘        │
//! │           └────────────────────┼─────────────────────┘                  │
//! │                                ▼                                        │
//! │                      ┌──────────────────────┐   ┌──────────────────┐    │
//! │                      │  TerminalWrapper     │   │  TokenProvider   │    │
//! │                      │  (bounded calls)     │◄──│  (cached token)  │    │
//! │                      └──────────┬───────────┘   └──────────────────┘    │
//! │                                 ▼                                       │
//! │                         dyn Terminal (vendor SDK / simulator)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`manager`] - `CardReaderManager` façade and its builder
//! - [`connection`] - Reader connection state machine and discovery lifecycle
//! - [`discovery`] - One discovery sequence over the terminal
//! - [`payments`] - Payment attempts, retry and cancel, Interac refunds
//! - [`firmware`] - Update availability checks and installs
//! - [`gate`] - Single-operation gate between payments and installs
//! - [`token`] - Connection token cache
//! - [`terminal`] - Vendor SDK seam, timeout wrapper and simulator
//! - [`config`] - Engine configuration (TOML + env)
//! - [`error`] - Engine error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cardreader::{CardReaderManagerBuilder, ReaderConfig};
//!
//! let manager = CardReaderManagerBuilder::new(ReaderConfig::load_or_default(None))
//!     .with_terminal(terminal)
//!     .with_credential_store(backend.clone())
//!     .with_capturer(backend)
//!     .build()?;
//! manager.initialize().await?;
//!
//! let mut discovery = manager.discover_configured_readers().await;
//! while let Some(event) = discovery.next().await {
//!     println!("{:?}", event);
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod firmware;
pub mod gate;
pub mod manager;
pub mod payments;
pub mod terminal;
pub mod token;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{DiscoverySettings, PaymentSettings, ReaderConfig, ReaderMode, TerminalSettings};
pub use connection::ConnectionManager;
pub use error::{ReaderError, ReaderResult};
pub use firmware::{InstallHandle, SoftwareUpdateManager};
pub use gate::{OperationGate, OperationKind};
pub use manager::{CardReaderManager, CardReaderManagerBuilder};
pub use payments::{
    PaymentAttempt, PaymentCapturer, PaymentManager, RefundAttempt, RefundManager,
};
pub use terminal::{
    SimulatedBackend, SimulatedTerminal, Terminal, TerminalEvent, TerminalWrapper,
    TransportTimeouts,
};
pub use token::{CredentialStore, TokenProvider};
