//! # Reader Software Updates
//!
//! Passive availability checks after each connection and user-initiated
//! firmware installs.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Availability:  Initializing ──► UpToDate | UpdateAvailable | CheckFailed│
//! │                                                                         │
//! │  Install:       Initializing ──► CheckFailed | UpToDate                 │
//! │                      │                                                  │
//! │                      ▼                                                  │
//! │              InstallationStarted ──► Installing(p) ... ──► Success      │
//! │                                                       └──► Failed       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod actions;
pub mod manager;

pub use manager::{InstallHandle, SoftwareUpdateManager};
