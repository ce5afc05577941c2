//! # Software Update Types
//!
//! Availability of reader firmware updates and the status of an install.
//!
//! ## Install Status Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Unknown ──► Initializing ──┬──► UpToDate                               │
//! │                             ├──► CheckFailed                            │
//! │                             └──► InstallationStarted                    │
//! │                                       │                                 │
//! │                                       ▼                                 │
//! │                              Installing(p) … p non-decreasing           │
//! │                                       │                                 │
//! │                              ┌────────┴────────┐                        │
//! │                              ▼                 ▼                        │
//! │                           Success           Failed                      │
//! │                                                                         │
//! │  Cancelling leaves the last emitted value in place.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Update Description
// =============================================================================

/// Vendor estimate of how long an install takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTimeEstimate {
    LessThanOneMinute,
    OneToTwoMinutes,
    TwoToFiveMinutes,
    FiveToFifteenMinutes,
}

/// A pending reader software update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReaderSoftwareUpdate {
    pub version: String,
    pub time_estimate: UpdateTimeEstimate,
    pub has_config_update: bool,
    pub has_firmware_update: bool,
    pub has_key_update: bool,
}

// =============================================================================
// Availability
// =============================================================================

/// Result of the passive update check run after each connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SoftwareUpdateAvailability {
    #[default]
    Initializing,
    UpToDate,
    UpdateAvailable(ReaderSoftwareUpdate),
    CheckFailed(String),
}

// =============================================================================
// Install Status
// =============================================================================

/// Why an install failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SoftwareUpdateErrorType {
    /// The reader refused to install because its battery is too low.
    BatteryLow { current_battery_level: Option<f32> },
    /// The reader went away mid-install.
    ReaderDisconnected,
    /// Any other failure.
    Failed,
}

/// Status of the current (or last) install attempt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SoftwareUpdateStatus {
    /// No install has been requested.
    #[default]
    Unknown,
    Initializing,
    UpToDate,
    CheckFailed { message: String },
    InstallationStarted,
    Installing { progress: f32 },
    Success,
    Failed {
        error_type: SoftwareUpdateErrorType,
        message: String,
    },
}

impl SoftwareUpdateStatus {
    /// Returns true for states that end an install attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SoftwareUpdateStatus::UpToDate
                | SoftwareUpdateStatus::CheckFailed { .. }
                | SoftwareUpdateStatus::Success
                | SoftwareUpdateStatus::Failed { .. }
        )
    }

    /// Returns the install progress, if this is an `Installing` state.
    pub fn progress(&self) -> Option<f32> {
        match self {
            SoftwareUpdateStatus::Installing { progress } => Some(*progress),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SoftwareUpdateStatus::Success.is_terminal());
        assert!(SoftwareUpdateStatus::UpToDate.is_terminal());
        assert!(SoftwareUpdateStatus::Failed {
            error_type: SoftwareUpdateErrorType::Failed,
            message: "x".into()
        }
        .is_terminal());
        assert!(!SoftwareUpdateStatus::Installing { progress: 0.5 }.is_terminal());
        assert!(!SoftwareUpdateStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_progress_accessor() {
        assert_eq!(SoftwareUpdateStatus::Installing { progress: 0.25 }.progress(), Some(0.25));
        assert_eq!(SoftwareUpdateStatus::Success.progress(), None);
    }
}
