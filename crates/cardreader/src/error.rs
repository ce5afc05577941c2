//! # Reader Error Types
//!
//! Error types for engine operations that report failure to the caller
//! directly (configuration, initialization, connection attempts).
//!
//! Payment, discovery and firmware failures do NOT use this type: they are
//! terminal values inside their event sequences.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Reader Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Connection    │  │     Credentials         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  ConnectionFail │  │  CredentialsUnavailable │ │
//! │  │  ConfigLoad     │  │  Cancelled      │  │                         │ │
//! │  │  ConfigSave     │  │  Timeout        │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │   Lifecycle     │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  NotInitialized │  │  Internal       │                              │
//! │  │  InitFailed     │  │  ChannelError   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use cardreader_core::{TerminalError, TerminalErrorCode};
use thiserror::Error;

/// Result type alias for engine operations.
pub type ReaderResult<T> = Result<T, ReaderError>;

/// Engine error type.
#[derive(Debug, Error)]
pub enum ReaderError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid card reader configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The façade was used before `initialize()`.
    #[error("Card reader manager is not initialized")]
    NotInitialized,

    /// The vendor terminal refused to initialize.
    #[error("Terminal initialization failed: {0}")]
    InitializationFailed(String),

    // =========================================================================
    // Connection Errors
    // =========================================================================
    /// The reader could not be connected.
    #[error("Connection to reader failed: {0}")]
    ConnectionFailed(String),

    /// The connection attempt was cancelled by the caller.
    #[error("Connection attempt cancelled")]
    ConnectionCancelled,

    /// The current reader could not be disconnected.
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),

    /// A bounded call did not finish in time.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    // =========================================================================
    // Credential Errors
    // =========================================================================
    /// The credential store could not mint a connection token.
    #[error("Connection token unavailable: {0}")]
    CredentialsUnavailable(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<TerminalError> for ReaderError {
    fn from(err: TerminalError) -> Self {
        match err.code {
            TerminalErrorCode::Canceled => ReaderError::ConnectionCancelled,
            _ => ReaderError::ConnectionFailed(err.to_string()),
        }
    }
}

impl From<std::io::Error> for ReaderError {
    fn from(err: std::io::Error) -> Self {
        ReaderError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for ReaderError {
    fn from(err: toml::de::Error) -> Self {
        ReaderError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for ReaderError {
    fn from(err: toml::ser::Error) -> Self {
        ReaderError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl ReaderError {
    /// Returns true if the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReaderError::ConnectionFailed(_)
                | ReaderError::ConnectionCancelled
                | ReaderError::DisconnectFailed(_)
                | ReaderError::Timeout(_)
                | ReaderError::CredentialsUnavailable(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ReaderError::InvalidConfig(_)
                | ReaderError::ConfigLoadFailed(_)
                | ReaderError::ConfigSaveFailed(_)
        )
    }
}
