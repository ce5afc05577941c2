//! # Vendor Terminal Boundary
//!
//! The narrow seam between the engine and the vendor terminal SDK.
//!
//! ## Call Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Terminal Boundary                                 │
//! │                                                                         │
//! │   Managers / Actions                                                   │
//! │         │                                                               │
//! │         ▼                                                               │
//! │   ┌──────────────────┐   bounded call    ┌──────────────────────────┐  │
//! │   │ TerminalWrapper  │ ────────────────► │ dyn Terminal             │  │
//! │   │ (timeouts, logs) │ ◄──────────────── │ (vendor SDK / simulator) │  │
//! │   └──────────────────┘ Result<_, Terminal└────────────┬─────────────┘  │
//! │                             Error>                     │                │
//! │                                                        │ callbacks      │
//! │                                                        ▼                │
//! │                                        broadcast::Receiver<TerminalEvent>│
//! │                                                                         │
//! │  Nothing outside this module holds a `dyn Terminal` directly.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The vendor SDK is callback-driven. Implementations translate its
//! callbacks into:
//! - a single `async` result per request/response call,
//! - an `mpsc` sink for multi-shot results (discovered readers, install
//!   progress),
//! - a `broadcast` channel for unsolicited notifications ([`TerminalEvent`]).

pub mod simulated;
pub mod wrapper;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use cardreader_core::{
    AdditionalInfoType, DiscoveryRequest, PaymentIntent, PaymentIntentParams, Reader,
    ReaderInputOption, ReaderSoftwareUpdate, Refund, RefundParams, TerminalError,
};

pub use simulated::{SimulatedBackend, SimulatedTerminal, SimulatedTerminalBuilder, TerminalCall};
pub use wrapper::{TerminalWrapper, TransportTimeouts};

/// Result type of every vendor call.
pub type TerminalResult<T> = Result<T, TerminalError>;

// =============================================================================
// Unsolicited Events
// =============================================================================

/// Notifications the vendor SDK raises outside of a request/response call.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    /// The reader is waiting for the customer to present a card.
    ReaderInputRequested(Vec<ReaderInputOption>),
    /// The reader wants a prompt shown to the customer.
    DisplayMessageRequested(AdditionalInfoType),
    /// Periodic battery report from the connected reader.
    BatteryLevelUpdate { level: f32, is_charging: bool },
    /// The reader's battery is low.
    LowBatteryWarning,
    /// The physical link dropped without a disconnect request.
    ReaderDisconnected,
    /// The vendor backend rejected the connection token.
    ConnectionTokenExpired,
}

// =============================================================================
// Traits
// =============================================================================

/// Source of connection tokens handed to the vendor SDK at initialization.
///
/// The SDK calls back into this whenever it needs a (fresh) token.
#[async_trait]
pub trait ConnectionTokenSource: Send + Sync {
    async fn fetch_connection_token(&self) -> TerminalResult<String>;
}

/// The vendor terminal SDK.
///
/// Every method may suspend for a physical-device round trip. Methods that
/// take a [`CancellationToken`] stop cooperatively and answer with
/// [`TerminalError::canceled`] once the reader has acknowledged.
#[async_trait]
pub trait Terminal: Send + Sync {
    /// Initializes the SDK with a token source.
    async fn initialize(&self, tokens: Arc<dyn ConnectionTokenSource>) -> TerminalResult<()>;

    fn is_initialized(&self) -> bool;

    /// Subscribes to unsolicited SDK notifications.
    fn subscribe(&self) -> broadcast::Receiver<TerminalEvent>;

    /// Scans for readers, pushing every updated list of found readers into
    /// `found`. Returns when the scan completes, fails, or is cancelled.
    async fn discover_readers(
        &self,
        request: DiscoveryRequest,
        found: mpsc::Sender<Vec<Reader>>,
        cancel: CancellationToken,
    ) -> TerminalResult<()>;

    async fn connect_reader(
        &self,
        reader: &Reader,
        location_id: &str,
        cancel: CancellationToken,
    ) -> TerminalResult<Reader>;

    async fn disconnect_reader(&self) -> TerminalResult<()>;

    async fn create_payment_intent(
        &self,
        params: &PaymentIntentParams,
    ) -> TerminalResult<PaymentIntent>;

    /// Waits for the customer to present a card.
    async fn collect_payment_method(
        &self,
        intent: PaymentIntent,
        cancel: CancellationToken,
    ) -> TerminalResult<PaymentIntent>;

    /// Confirms the collected payment with the card network.
    async fn process_payment(&self, intent: PaymentIntent) -> TerminalResult<PaymentIntent>;

    async fn cancel_payment_intent(&self, intent: PaymentIntent) -> TerminalResult<PaymentIntent>;

    /// Waits for the customer to present the card of the charge being
    /// refunded. The SDK keeps the collected refund for `process_refund`.
    async fn collect_refund_payment_method(
        &self,
        params: &RefundParams,
        cancel: CancellationToken,
    ) -> TerminalResult<()>;

    /// Sends the collected refund to the card network.
    async fn process_refund(&self) -> TerminalResult<Refund>;

    /// Returns the pending update for the connected reader, if any.
    async fn check_for_update(&self) -> TerminalResult<Option<ReaderSoftwareUpdate>>;

    /// Installs an update, pushing raw progress values into `progress`.
    async fn install_update(
        &self,
        update: ReaderSoftwareUpdate,
        progress: mpsc::Sender<f32>,
        cancel: CancellationToken,
    ) -> TerminalResult<()>;
}
