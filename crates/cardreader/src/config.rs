//! # Card Reader Configuration
//!
//! Configuration management for the card reader engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CARDREADER_MODE=simulated                                          │
//! │     CARDREADER_LOCATION_ID=tml_123                                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/cardreader/cardreader.toml (Linux)                       │
//! │     ~/Library/Application Support/com.cardreader.engine/... (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     ReaderMode::Hardware, vendor-recommended timeouts                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # cardreader.toml
//! [discovery]
//! mode = "simulated"   # hardware | simulated
//! location_id = "tml_FfRt6tdq8YbK"
//! reader_types = ["stripe_m2", "wise_pade3"]
//!
//! [terminal]
//! connect_timeout_secs = 60
//! collect_timeout_secs = 120
//!
//! [payments]
//! capture_timeout_secs = 30
//!
//! [payments.minimum_charges]
//! USD = 50
//! GBP = 30
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use cardreader_core::{DiscoveryRequest, Money, ReaderType, ReaderTypesToDiscover};

use crate::error::{ReaderError, ReaderResult};

// =============================================================================
// Reader Mode
// =============================================================================

/// Whether discovery targets real hardware or the vendor's simulated readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderMode {
    /// Real Bluetooth / USB / built-in readers.
    #[default]
    Hardware,

    /// Vendor-simulated readers, for development and store demos.
    Simulated,
}

impl ReaderMode {
    pub fn is_simulated(&self) -> bool {
        matches!(self, ReaderMode::Simulated)
    }
}

impl std::fmt::Display for ReaderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderMode::Hardware => write!(f, "hardware"),
            ReaderMode::Simulated => write!(f, "simulated"),
        }
    }
}

impl std::str::FromStr for ReaderMode {
    type Err = ReaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hardware" | "real" => Ok(ReaderMode::Hardware),
            "simulated" | "simulator" | "sim" => Ok(ReaderMode::Simulated),
            other => Err(ReaderError::InvalidConfig(format!(
                "Unknown reader mode: '{}'. Valid options: hardware, simulated",
                other
            ))),
        }
    }
}

// =============================================================================
// Discovery Settings
// =============================================================================

/// Defaults for discovery and connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Hardware or simulated readers.
    #[serde(default)]
    pub mode: ReaderMode,

    /// Location to register the reader to on connect.
    #[serde(default)]
    pub location_id: Option<String>,

    /// Reader models to look for. Empty means any supported model.
    #[serde(default)]
    pub reader_types: Vec<ReaderType>,
}

impl DiscoverySettings {
    /// Builds the discovery request these settings describe.
    pub fn discovery_request(&self) -> DiscoveryRequest {
        DiscoveryRequest {
            simulated: self.mode.is_simulated(),
            reader_types: if self.reader_types.is_empty() {
                ReaderTypesToDiscover::Unspecified
            } else {
                ReaderTypesToDiscover::SpecificReaders(self.reader_types.clone())
            },
        }
    }
}

// =============================================================================
// Terminal Settings
// =============================================================================

/// Upper bounds for each vendor round trip.
///
/// A reader that silently drops its link would otherwise leave a payment
/// hanging forever; every bound ends in a `*Failed` state instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_short_timeout")]
    pub disconnect_timeout_secs: u64,

    #[serde(default = "default_intent_timeout")]
    pub create_intent_timeout_secs: u64,

    /// Includes the time the customer takes to present a card.
    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_secs: u64,

    #[serde(default = "default_process_timeout")]
    pub process_timeout_secs: u64,

    #[serde(default = "default_short_timeout")]
    pub cancel_timeout_secs: u64,

    #[serde(default = "default_intent_timeout")]
    pub update_check_timeout_secs: u64,

    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
}

fn default_discovery_timeout() -> u64 {
    60
}
fn default_connect_timeout() -> u64 {
    60
}
fn default_short_timeout() -> u64 {
    15
}
fn default_intent_timeout() -> u64 {
    30
}
fn default_collect_timeout() -> u64 {
    120
}
fn default_process_timeout() -> u64 {
    60
}
fn default_install_timeout() -> u64 {
    20 * 60
}

impl Default for TerminalSettings {
    fn default() -> Self {
        TerminalSettings {
            discovery_timeout_secs: default_discovery_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            disconnect_timeout_secs: default_short_timeout(),
            create_intent_timeout_secs: default_intent_timeout(),
            collect_timeout_secs: default_collect_timeout(),
            process_timeout_secs: default_process_timeout(),
            cancel_timeout_secs: default_short_timeout(),
            update_check_timeout_secs: default_intent_timeout(),
            install_timeout_secs: default_install_timeout(),
        }
    }
}

// =============================================================================
// Payment Settings
// =============================================================================

/// Payment rules that vary per store/country.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSettings {
    /// Minimum charge in minor units, keyed by upper-case currency code.
    #[serde(default = "default_minimum_charges")]
    pub minimum_charges: BTreeMap<String, i64>,

    /// Bound on the backend capture call.
    #[serde(default = "default_intent_timeout")]
    pub capture_timeout_secs: u64,
}

fn default_minimum_charges() -> BTreeMap<String, i64> {
    BTreeMap::from([
        ("USD".to_string(), 50),
        ("CAD".to_string(), 50),
        ("GBP".to_string(), 30),
    ])
}

impl Default for PaymentSettings {
    fn default() -> Self {
        PaymentSettings {
            minimum_charges: default_minimum_charges(),
            capture_timeout_secs: default_intent_timeout(),
        }
    }
}

impl PaymentSettings {
    /// Minimum charge for a currency, if one is configured.
    pub fn minimum_charge(&self, currency: &str) -> Option<Money> {
        self.minimum_charges
            .get(&currency.to_uppercase())
            .copied()
            .map(Money::from_minor_units)
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReaderConfig {
    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub terminal: TerminalSettings,

    #[serde(default)]
    pub payments: PaymentSettings,
}

impl ReaderConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file, then applies environment overrides.
    pub fn load(config_path: Option<PathBuf>) -> ReaderResult<Self> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ReaderError::ConfigLoadFailed("No config directory".into()))?;

        let mut config = if path.exists() {
            info!(path = %path.display(), "Loading card reader config");
            let contents = std::fs::read_to_string(&path)?;
            toml::from_str(&contents)?
        } else {
            debug!(path = %path.display(), "Config file not found, using defaults");
            ReaderConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration, falling back to defaults on any error.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!(?e, "Failed to load card reader config, using defaults");
            let mut config = ReaderConfig::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Saves configuration to a file.
    pub fn save(&self, config_path: Option<PathBuf>) -> ReaderResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ReaderError::ConfigSaveFailed("No config directory".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ReaderError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| ReaderError::ConfigSaveFailed(e.to_string()))?;
        info!(path = %path.display(), "Saved card reader config");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ReaderResult<()> {
        let t = &self.terminal;
        let bounds = [
            ("discovery_timeout_secs", t.discovery_timeout_secs),
            ("connect_timeout_secs", t.connect_timeout_secs),
            ("disconnect_timeout_secs", t.disconnect_timeout_secs),
            ("create_intent_timeout_secs", t.create_intent_timeout_secs),
            ("collect_timeout_secs", t.collect_timeout_secs),
            ("process_timeout_secs", t.process_timeout_secs),
            ("cancel_timeout_secs", t.cancel_timeout_secs),
            ("update_check_timeout_secs", t.update_check_timeout_secs),
            ("install_timeout_secs", t.install_timeout_secs),
            ("capture_timeout_secs", self.payments.capture_timeout_secs),
        ];
        if let Some((name, _)) = bounds.iter().find(|(_, secs)| *secs == 0) {
            return Err(ReaderError::InvalidConfig(format!("{} must be greater than 0", name)));
        }

        for (currency, minimum) in &self.payments.minimum_charges {
            if cardreader_core::validation::validate_currency(currency).is_err() {
                return Err(ReaderError::InvalidConfig(format!(
                    "Invalid currency code in minimum_charges: '{}'",
                    currency
                )));
            }
            if *minimum < 0 {
                return Err(ReaderError::InvalidConfig(format!(
                    "Minimum charge for {} cannot be negative",
                    currency
                )));
            }
        }

        if let Some(location) = &self.discovery.location_id {
            if location.trim().is_empty() {
                return Err(ReaderError::InvalidConfig("location_id cannot be blank".into()));
            }
        }
        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        // Reader mode
        if let Ok(mode) = std::env::var("CARDREADER_MODE") {
            match mode.parse::<ReaderMode>() {
                Ok(m) => {
                    debug!(mode = %m, "Overriding reader mode from environment");
                    self.discovery.mode = m;
                }
                Err(e) => warn!(?e, "Invalid CARDREADER_MODE"),
            }
        }

        // Location
        if let Ok(location) = std::env::var("CARDREADER_LOCATION_ID") {
            debug!(location = %location, "Overriding location from environment");
            self.discovery.location_id = Some(location);
        }

        // Collect timeout
        if let Ok(secs) = std::env::var("CARDREADER_COLLECT_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                debug!(secs = s, "Overriding collect timeout from environment");
                self.terminal.collect_timeout_secs = s;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "cardreader", "engine")
            .map(|dirs| dirs.config_dir().join("cardreader.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_mode_parsing() {
        assert_eq!("hardware".parse::<ReaderMode>().unwrap(), ReaderMode::Hardware);
        assert_eq!("SIM".parse::<ReaderMode>().unwrap(), ReaderMode::Simulated);
        assert!("bluetooth".parse::<ReaderMode>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = ReaderConfig::default();
        assert_eq!(config.discovery.mode, ReaderMode::Hardware);
        assert_eq!(config.terminal.collect_timeout_secs, 120);
        assert_eq!(
            config.payments.minimum_charge("usd"),
            Some(Money::from_minor_units(50))
        );
        assert_eq!(
            config.payments.minimum_charge("GBP"),
            Some(Money::from_minor_units(30))
        );
        assert_eq!(config.payments.minimum_charge("CZK"), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ReaderConfig::default();
        config.terminal.process_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ReaderConfig::default();
        config.payments.minimum_charges.insert("DOLLARS".into(), 10);
        assert!(config.validate().is_err());

        let mut config = ReaderConfig::default();
        config.discovery.location_id = Some("  ".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_discovery_request_from_settings() {
        let mut settings = DiscoverySettings::default();
        assert_eq!(settings.discovery_request().reader_types, ReaderTypesToDiscover::Unspecified);

        settings.mode = ReaderMode::Simulated;
        settings.reader_types = vec![ReaderType::StripeM2];
        let request = settings.discovery_request();
        assert!(request.simulated);
        assert!(request.reader_types.includes(ReaderType::StripeM2));
        assert!(!request.reader_types.includes(ReaderType::Chipper2X));
    }

    #[test]
    fn test_toml_round_trip_keeps_sections() {
        let toml_str = toml::to_string_pretty(&ReaderConfig::default()).unwrap();
        assert!(toml_str.contains("[terminal]"));
        assert!(toml_str.contains("[payments.minimum_charges]"));

        let parsed: ReaderConfig = toml::from_str("[discovery]\nmode = \"simulated\"\n").unwrap();
        assert!(parsed.discovery.mode.is_simulated());
        assert_eq!(parsed.terminal.connect_timeout_secs, 60);
    }
}
