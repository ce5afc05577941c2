//! # Reader Types
//!
//! Readers, the connection state machine's states, discovery events, and the
//! side-channel notifications a connected reader produces.
//!
//! ## Connection State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ConnectionStatus                                   │
//! │                                                                         │
//! │        connect()             vendor ack                                 │
//! │  ┌──────────────┐  ──────►  ┌────────────┐  ──────►  ┌───────────────┐ │
//! │  │ NotConnected │           │ Connecting │           │ Connected(r)  │ │
//! │  └──────────────┘  ◄──────  └────────────┘           └───────┬───────┘ │
//! │         ▲          failure / cancel                          │         │
//! │         │                                                    │         │
//! │         └──────────── disconnect() or link loss ─────────────┘         │
//! │                                                                         │
//! │  Reconnection is never automatic.                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

// =============================================================================
// Reader
// =============================================================================

/// Supported physical reader models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ReaderType {
    /// BBPOS Chipper 2X BT.
    Chipper2X,
    /// Stripe Reader M2.
    StripeM2,
    /// BBPOS WisePad 3.
    WisePade3,
    /// The phone itself acting as a tap-to-pay reader.
    CotsDevice,
}

impl ReaderType {
    /// Returns true for readers built into the host device.
    pub fn is_built_in(&self) -> bool {
        matches!(self, ReaderType::CotsDevice)
    }

    /// Returns true for readers reached over Bluetooth or USB.
    pub fn is_external(&self) -> bool {
        !self.is_built_in()
    }
}

impl fmt::Display for ReaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderType::Chipper2X => write!(f, "CHIPPER_2X"),
            ReaderType::StripeM2 => write!(f, "STRIPE_M2"),
            ReaderType::WisePade3 => write!(f, "WISEPAD_3"),
            ReaderType::CotsDevice => write!(f, "COTS_DEVICE"),
        }
    }
}

/// A physical reader as reported by discovery.
///
/// Immutable: each discovery cycle produces fresh instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Reader {
    /// Serial number, when the transport reports one.
    pub id: Option<String>,

    /// Device model.
    pub reader_type: ReaderType,

    /// Battery level in `[0.0, 1.0]`, when known.
    pub battery_level: Option<f32>,

    /// Installed firmware version, when known.
    pub firmware_version: Option<String>,

    /// Location the reader is registered to, once connected.
    pub location_id: Option<String>,

    /// When discovery reported this reader.
    #[ts(as = "String")]
    pub discovered_at: DateTime<Utc>,
}

impl Reader {
    /// Creates a reader with no optional details.
    pub fn new(id: Option<String>, reader_type: ReaderType, discovered_at: DateTime<Utc>) -> Self {
        Reader {
            id,
            reader_type,
            battery_level: None,
            firmware_version: None,
            location_id: None,
            discovered_at,
        }
    }

    /// Sets the battery level, clamped to `[0.0, 1.0]`.
    pub fn with_battery_level(mut self, level: f32) -> Self {
        self.battery_level = Some(level.clamp(0.0, 1.0));
        self
    }

    /// Sets the firmware version.
    pub fn with_firmware_version(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    /// Human-readable label for logs.
    pub fn display_name(&self) -> String {
        match &self.id {
            Some(id) => format!("{} ({})", id, self.reader_type),
            None => self.reader_type.to_string(),
        }
    }

    /// Returns true when both values describe the same physical device.
    pub fn is_same_device(&self, other: &Reader) -> bool {
        self.reader_type == other.reader_type && self.id.is_some() && self.id == other.id
    }
}

/// Which reader models a discovery should look for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", content = "readers", rename_all = "snake_case")]
pub enum ReaderTypesToDiscover {
    /// Any supported model.
    #[default]
    Unspecified,
    /// Only the listed models.
    SpecificReaders(Vec<ReaderType>),
}

impl ReaderTypesToDiscover {
    /// Returns true if a reader of this type should be reported.
    pub fn includes(&self, reader_type: ReaderType) -> bool {
        match self {
            ReaderTypesToDiscover::Unspecified => true,
            ReaderTypesToDiscover::SpecificReaders(types) => types.contains(&reader_type),
        }
    }
}

/// Parameters of one discovery sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Discover the vendor's simulated readers instead of real hardware.
    pub simulated: bool,

    /// Models to report.
    pub reader_types: ReaderTypesToDiscover,
}

// =============================================================================
// Connection Status
// =============================================================================

/// Current reader connection status. Exactly one value holds at a time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "status", content = "reader", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No reader attached.
    #[default]
    NotConnected,
    /// A connection attempt is in flight.
    Connecting,
    /// A reader is attached and ready.
    Connected(Reader),
}

impl ConnectionStatus {
    /// Returns true if a reader is attached.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected(_))
    }

    /// Returns the attached reader, if any.
    pub fn connected_reader(&self) -> Option<&Reader> {
        match self {
            ConnectionStatus::Connected(reader) => Some(reader),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::NotConnected => write!(f, "not_connected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected(_) => write!(f, "connected"),
        }
    }
}

// =============================================================================
// Discovery Events
// =============================================================================

/// One event of a discovery sequence.
///
/// A sequence is `Started → ReadersFound* → (Succeeded | Failed)` and never
/// emits anything after its terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    Started,
    ReadersFound(Vec<Reader>),
    Succeeded,
    Failed(String),
}

impl DiscoveryEvent {
    /// Returns true for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiscoveryEvent::Succeeded | DiscoveryEvent::Failed(_))
    }
}

// =============================================================================
// Battery
// =============================================================================

/// Coarse battery band reported alongside the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum BatteryLevelBand {
    Critical,
    Low,
    Nominal,
}

impl BatteryLevelBand {
    /// Classifies a level in `[0.0, 1.0]`.
    pub fn from_level(level: f32) -> Self {
        if level <= 0.05 {
            BatteryLevelBand::Critical
        } else if level <= 0.2 {
            BatteryLevelBand::Low
        } else {
            BatteryLevelBand::Nominal
        }
    }
}

/// Battery status of the connected reader.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatteryStatus {
    /// No reader, or the reader has not reported yet.
    #[default]
    Unknown,
    /// Latest level report.
    StatusChanged {
        level: f32,
        band: BatteryLevelBand,
        is_charging: bool,
    },
    /// The reader raised a low-battery warning.
    Warning,
}

// =============================================================================
// Reader Messages
// =============================================================================

/// Ways a card can be presented to the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ReaderInputOption {
    Insert,
    Swipe,
    Tap,
}

impl fmt::Display for ReaderInputOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderInputOption::Insert => write!(f, "Insert"),
            ReaderInputOption::Swipe => write!(f, "Swipe"),
            ReaderInputOption::Tap => write!(f, "Tap"),
        }
    }
}

/// Prompts the reader asks the app to show to the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum AdditionalInfoType {
    RetryCard,
    InsertCard,
    InsertOrSwipeCard,
    SwipeCard,
    RemoveCard,
    MultipleContactlessCardsDetected,
    TryAnotherReadMethod,
    TryAnotherCard,
    CheckMobileDevice,
    CardRemovedTooEarly,
}

/// Latest reader-originated message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ReaderMessage {
    #[default]
    NoMessage,
    DisplayMessage(AdditionalInfoType),
    InputMessage(Vec<ReaderInputOption>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(id: &str, reader_type: ReaderType) -> Reader {
        Reader::new(Some(id.to_string()), reader_type, Utc::now())
    }

    #[test]
    fn test_types_to_discover_filter() {
        let only_m2 = ReaderTypesToDiscover::SpecificReaders(vec![ReaderType::StripeM2]);
        assert!(only_m2.includes(ReaderType::StripeM2));
        assert!(!only_m2.includes(ReaderType::Chipper2X));
        assert!(ReaderTypesToDiscover::Unspecified.includes(ReaderType::WisePade3));
    }

    #[test]
    fn test_connection_status_accessors() {
        let r = reader("CHB2001", ReaderType::Chipper2X);
        let status = ConnectionStatus::Connected(r.clone());
        assert!(status.is_connected());
        assert_eq!(status.connected_reader(), Some(&r));
        assert_eq!(status.to_string(), "connected");
        assert!(!ConnectionStatus::Connecting.is_connected());
    }

    #[test]
    fn test_discovery_terminal_events() {
        assert!(DiscoveryEvent::Succeeded.is_terminal());
        assert!(DiscoveryEvent::Failed("boom".into()).is_terminal());
        assert!(!DiscoveryEvent::ReadersFound(vec![]).is_terminal());
    }

    #[test]
    fn test_battery_level_clamped_and_banded() {
        let r = reader("M2", ReaderType::StripeM2).with_battery_level(1.7);
        assert_eq!(r.battery_level, Some(1.0));
        assert_eq!(BatteryLevelBand::from_level(0.03), BatteryLevelBand::Critical);
        assert_eq!(BatteryLevelBand::from_level(0.15), BatteryLevelBand::Low);
        assert_eq!(BatteryLevelBand::from_level(0.8), BatteryLevelBand::Nominal);
    }

    #[test]
    fn test_same_device_requires_serial() {
        let a = reader("X1", ReaderType::StripeM2);
        let b = reader("X1", ReaderType::StripeM2);
        let anonymous = Reader::new(None, ReaderType::StripeM2, Utc::now());
        assert!(a.is_same_device(&b));
        assert!(!anonymous.is_same_device(&anonymous.clone()));
    }

    #[test]
    fn test_status_serializes_tagged() {
        let json = serde_json::to_string(&ConnectionStatus::NotConnected).unwrap();
        assert_eq!(json, r#"{"status":"not_connected"}"#);
    }
}
