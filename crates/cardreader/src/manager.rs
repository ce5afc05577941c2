//! # Card Reader Manager
//!
//! The public surface of the engine. Wires the managers together, routes
//! vendor notifications, and gates payments against firmware installs.
//!
//! ## Manager Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     CardReaderManager Architecture                      │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      CardReaderManager                           │  │
//! │  │                                                                  │  │
//! │  │  • Initializes the terminal with the TokenProvider               │  │
//! │  │  • Runs the event pump (battery, messages, link loss, tokens)    │  │
//! │  │  • Checks for updates each time a reader connects                │  │
//! │  │  • Holds the single-operation gate                               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  Connection    │  │   Payment /    │  │  SoftwareUpdate        │    │
//! │  │  Manager       │  │   Refund Mgr   │  │  Manager               │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  OBSERVABLES:                                                          │
//! │  ───────────                                                           │
//! │  reader_status, battery_status, reader_messages,                       │
//! │  software_update_status, software_update_availability, initialized     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cardreader_core::{
    BatteryStatus, CardPaymentStatus, ConnectionStatus, DiscoveryEvent, DiscoveryRequest,
    PaymentData, PaymentInfo, Reader, ReaderMessage, ReaderTypesToDiscover, RefundParams,
    SoftwareUpdateAvailability, SoftwareUpdateStatus,
};

use crate::config::ReaderConfig;
use crate::connection::ConnectionManager;
use crate::error::{ReaderError, ReaderResult};
use crate::firmware::{InstallHandle, SoftwareUpdateManager};
use crate::gate::{OperationGate, OperationKind};
use crate::payments::manager::reader_busy;
use crate::payments::refund::refund_failure;
use crate::payments::{PaymentAttempt, PaymentCapturer, PaymentManager, RefundAttempt, RefundManager};
use crate::terminal::{
    ConnectionTokenSource, Terminal, TerminalEvent, TerminalWrapper, TransportTimeouts,
};
use crate::token::{CredentialStore, TokenProvider};

// =============================================================================
// Card Reader Manager
// =============================================================================

/// Single entry point for reader discovery, connection, payments and
/// firmware updates.
pub struct CardReaderManager {
    config: ReaderConfig,
    terminal: TerminalWrapper,
    tokens: Arc<TokenProvider>,
    connection: Arc<ConnectionManager>,
    payments: PaymentManager,
    refunds: RefundManager,
    software_update: Arc<SoftwareUpdateManager>,
    gate: OperationGate,
    initialized_tx: watch::Sender<bool>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl CardReaderManager {
    fn new(
        config: ReaderConfig,
        terminal: Arc<dyn Terminal>,
        credentials: Arc<dyn CredentialStore>,
        capturer: Arc<dyn PaymentCapturer>,
    ) -> Self {
        let terminal = TerminalWrapper::new(terminal, TransportTimeouts::from(&config.terminal));
        let connection = Arc::new(ConnectionManager::new(terminal.clone()));
        let payments = PaymentManager::new(
            terminal.clone(),
            capturer,
            connection.subscribe_status(),
            config.payments.clone(),
        );
        let refunds = RefundManager::new(terminal.clone(), connection.subscribe_status());
        let software_update = Arc::new(SoftwareUpdateManager::new(
            terminal.clone(),
            connection.clone(),
        ));
        let (initialized_tx, _) = watch::channel(false);

        Self {
            config,
            terminal,
            tokens: Arc::new(TokenProvider::new(credentials)),
            connection,
            payments,
            refunds,
            software_update,
            gate: OperationGate::new(),
            initialized_tx,
            event_pump: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Returns true once the terminal is initialized and tokens can be served.
    pub fn is_initialized(&self) -> bool {
        *self.initialized_tx.borrow()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Initializes the vendor terminal and starts routing its notifications.
    ///
    /// Calling this again after success is a no-op.
    pub async fn initialize(&self) -> ReaderResult<()> {
        let mut pump = self.event_pump.lock().await;
        if pump.is_some() {
            debug!("Card reader manager already initialized");
            return Ok(());
        }

        info!(mode = %self.config.discovery.mode, "Initializing card reader manager");
        let tokens: Arc<dyn ConnectionTokenSource> = self.tokens.clone();
        self.terminal.initialize(tokens).await.map_err(|e| {
            warn!(code = %e.code, message = %e.message, "Terminal initialization failed");
            ReaderError::InitializationFailed(e.message)
        })?;

        *pump = Some(self.spawn_event_pump());
        self.initialized_tx.send_replace(true);
        info!("Card reader manager initialized");
        Ok(())
    }

    /// Stops the event pump and disconnects the reader.
    pub async fn shutdown(&self) {
        info!("Shutting down card reader manager");
        self.shutdown.cancel();
        self.connection.cancel_discovery().await;
        self.software_update.cancel_ongoing_firmware_update().await;
        self.connection.disconnect_reader().await;

        if let Some(pump) = self.event_pump.lock().await.take() {
            let _ = pump.await;
        }
        self.initialized_tx.send_replace(false);
        info!("Card reader manager stopped");
    }

    fn spawn_event_pump(&self) -> JoinHandle<()> {
        let mut events = self.terminal.subscribe();
        let mut status = self.connection.subscribe_status();
        let connection = self.connection.clone();
        let tokens = self.tokens.clone();
        let software_update = self.software_update.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => route_event(&connection, &tokens, event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Terminal notifications dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = status.borrow_and_update().is_connected();
                        if connected {
                            let software_update = software_update.clone();
                            tokio::spawn(async move {
                                software_update.check_availability().await;
                            });
                        } else {
                            software_update.reset_availability();
                        }
                    }
                }
            }
            debug!("Terminal event pump stopped");
        })
    }

    // =========================================================================
    // Discovery & Connection
    // =========================================================================

    /// Starts a discovery sequence, cancelling any active one.
    pub async fn discover_readers(
        &self,
        simulated: bool,
        reader_types: ReaderTypesToDiscover,
    ) -> BoxStream<'static, DiscoveryEvent> {
        if !self.is_initialized() {
            warn!("Discovery requested before initialization");
            return stream::iter(vec![
                DiscoveryEvent::Started,
                DiscoveryEvent::Failed(ReaderError::NotInitialized.to_string()),
            ])
            .boxed();
        }
        self.connection
            .discover_readers(DiscoveryRequest {
                simulated,
                reader_types,
            })
            .await
    }

    /// Starts a discovery sequence with the configured mode and reader types.
    pub async fn discover_configured_readers(&self) -> BoxStream<'static, DiscoveryEvent> {
        let request = self.config.discovery.discovery_request();
        self.discover_readers(request.simulated, request.reader_types)
            .await
    }

    pub async fn cancel_discovery(&self) {
        self.connection.cancel_discovery().await;
    }

    /// Connects to `reader`, disconnecting the current one first.
    pub async fn start_connection_to_reader(
        &self,
        reader: Reader,
        location_id: &str,
    ) -> ReaderResult<Reader> {
        if !self.is_initialized() {
            return Err(ReaderError::NotInitialized);
        }
        self.connection
            .start_connection_to_reader(reader, location_id)
            .await
    }

    /// Connects to `reader` at the configured location.
    pub async fn start_connection_to_default_location(
        &self,
        reader: Reader,
    ) -> ReaderResult<Reader> {
        let location_id = self.config.discovery.location_id.clone().ok_or_else(|| {
            ReaderError::InvalidConfig("no default location configured".into())
        })?;
        self.start_connection_to_reader(reader, &location_id).await
    }

    pub async fn cancel_connection_attempt(&self) -> bool {
        self.connection.cancel_connection_attempt().await
    }

    pub async fn disconnect_reader(&self) -> bool {
        self.connection.disconnect_reader().await
    }

    // =========================================================================
    // Payments
    // =========================================================================

    pub async fn collect_payment(&self, info: PaymentInfo) -> PaymentAttempt {
        match self.gate.try_acquire(OperationKind::Payment) {
            Some(permit) => self.payments.collect_payment(info, Some(permit)).await,
            None => {
                warn!(order_id = info.order_id, "Payment requested while the reader is busy");
                PaymentAttempt::finished(CardPaymentStatus::InitializingPaymentFailed(
                    reader_busy(),
                ))
            }
        }
    }

    pub async fn retry_collect_payment(
        &self,
        order_id: i64,
        payment_data: PaymentData,
    ) -> PaymentAttempt {
        match self.gate.try_acquire(OperationKind::Payment) {
            Some(permit) => {
                self.payments
                    .retry_collect_payment(order_id, payment_data, Some(permit))
                    .await
            }
            None => {
                warn!(order_id, "Payment retry requested while the reader is busy");
                self.payments.reject_busy_retry(order_id, payment_data).await
            }
        }
    }

    pub async fn cancel_payment(&self, payment_data: PaymentData) {
        self.payments.cancel_payment(payment_data).await;
    }

    // =========================================================================
    // Interac Refunds
    // =========================================================================

    pub async fn refund_interac_payment(&self, params: RefundParams) -> RefundAttempt {
        match self.gate.try_acquire(OperationKind::Refund) {
            Some(permit) => self.refunds.refund_interac_payment(params, Some(permit)).await,
            None => {
                warn!(charge_id = %params.charge_id, "Refund requested while the reader is busy");
                RefundAttempt::finished(refund_failure(params, "reader busy"))
            }
        }
    }

    /// Returns true if the running refund was still collecting and is now
    /// being cancelled.
    pub async fn cancel_interac_refund(&self) -> bool {
        self.refunds.cancel_interac_refund().await
    }

    // =========================================================================
    // Software Updates
    // =========================================================================

    /// Starts a firmware install, or joins the one already running.
    pub async fn start_async_software_update(&self) -> InstallHandle {
        if let Some(active) = self.software_update.join_active().await {
            return active;
        }
        match self.gate.try_acquire(OperationKind::SoftwareUpdate) {
            Some(permit) => {
                self.software_update
                    .start_async_software_update(Some(permit))
                    .await
            }
            None => self.software_update.reject_busy(),
        }
    }

    pub async fn cancel_ongoing_firmware_update(&self) {
        self.software_update.cancel_ongoing_firmware_update().await;
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    pub async fn clear_cached_credentials(&self) {
        self.tokens.clear_cached_credentials().await;
    }

    // =========================================================================
    // Observables
    // =========================================================================

    pub fn reader_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe_status()
    }

    pub fn reader_status_stream(&self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.reader_status())
    }

    pub fn battery_status(&self) -> watch::Receiver<BatteryStatus> {
        self.connection.subscribe_battery()
    }

    pub fn battery_status_stream(&self) -> WatchStream<BatteryStatus> {
        WatchStream::new(self.battery_status())
    }

    pub fn reader_messages(&self) -> watch::Receiver<ReaderMessage> {
        self.connection.subscribe_messages()
    }

    pub fn reader_messages_stream(&self) -> WatchStream<ReaderMessage> {
        WatchStream::new(self.reader_messages())
    }

    pub fn software_update_status(&self) -> watch::Receiver<SoftwareUpdateStatus> {
        self.software_update.subscribe_status()
    }

    pub fn software_update_status_stream(&self) -> WatchStream<SoftwareUpdateStatus> {
        WatchStream::new(self.software_update_status())
    }

    pub fn software_update_availability(&self) -> watch::Receiver<SoftwareUpdateAvailability> {
        self.software_update.subscribe_availability()
    }

    pub fn software_update_availability_stream(&self) -> WatchStream<SoftwareUpdateAvailability> {
        WatchStream::new(self.software_update_availability())
    }

    pub fn initialized(&self) -> watch::Receiver<bool> {
        self.initialized_tx.subscribe()
    }
}

impl Drop for CardReaderManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn route_event(connection: &ConnectionManager, tokens: &TokenProvider, event: TerminalEvent) {
    match event {
        TerminalEvent::BatteryLevelUpdate { level, is_charging } => {
            connection.update_battery(level, is_charging)
        }
        TerminalEvent::LowBatteryWarning => connection.battery_warning(),
        TerminalEvent::ReaderDisconnected => connection.handle_unexpected_disconnect(),
        TerminalEvent::ConnectionTokenExpired => tokens.handle_token_expired().await,
        TerminalEvent::ReaderInputRequested(options) => {
            connection.publish_message(ReaderMessage::InputMessage(options))
        }
        TerminalEvent::DisplayMessageRequested(info) => {
            connection.publish_message(ReaderMessage::DisplayMessage(info))
        }
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`CardReaderManager`].
pub struct CardReaderManagerBuilder {
    config: ReaderConfig,
    terminal: Option<Arc<dyn Terminal>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    capturer: Option<Arc<dyn PaymentCapturer>>,
}

impl CardReaderManagerBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: ReaderConfig) -> Self {
        CardReaderManagerBuilder {
            config,
            terminal: None,
            credentials: None,
            capturer: None,
        }
    }

    /// Sets the vendor terminal implementation.
    pub fn with_terminal(mut self, terminal: Arc<dyn Terminal>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    /// Sets the connection-token issuer.
    pub fn with_credential_store(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the backend that captures processed payments.
    pub fn with_capturer(mut self, capturer: Arc<dyn PaymentCapturer>) -> Self {
        self.capturer = Some(capturer);
        self
    }

    /// Builds the manager.
    pub fn build(self) -> ReaderResult<CardReaderManager> {
        self.config.validate()?;
        let terminal = self
            .terminal
            .ok_or_else(|| ReaderError::InvalidConfig("Terminal required".into()))?;
        let credentials = self
            .credentials
            .ok_or_else(|| ReaderError::InvalidConfig("Credential store required".into()))?;
        let capturer = self
            .capturer
            .ok_or_else(|| ReaderError::InvalidConfig("Payment capturer required".into()))?;

        Ok(CardReaderManager::new(
            self.config,
            terminal,
            credentials,
            capturer,
        ))
    }
}
