//! # Connection Manager
//!
//! Owns the reader connection state machine, the discovery lifecycle and the
//! reader-scoped observables (battery, reader messages).
//!
//! ## Connection State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Reader Connection States                             │
//! │                                                                         │
//! │  ┌──────────────┐  start_connection  ┌────────────┐                    │
//! │  │ NotConnected │ ─────────────────► │ Connecting │                    │
//! │  └──────────────┘                    └─────┬──────┘                    │
//! │        ▲   ▲                               │                            │
//! │        │   │      failure / cancel         │  success                   │
//! │        │   └───────────────────────────────┤                            │
//! │        │                                   ▼                            │
//! │        │                            ┌────────────┐                      │
//! │        └─────────────────────────── │ Connected  │                      │
//! │          disconnect / link lost     └────────────┘                      │
//! │                                                                         │
//! │  Connecting while Connected disconnects the current reader first.     │
//! │  Reconnection is never automatic.                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only this manager mutates [`ConnectionStatus`]. Everyone else reads it
//! through a `watch::Receiver`.

use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cardreader_core::{
    BatteryLevelBand, BatteryStatus, ConnectionStatus, DiscoveryEvent, DiscoveryRequest, Reader,
    ReaderMessage, TerminalErrorCode,
};

use crate::discovery::DiscoveryAction;
use crate::error::{ReaderError, ReaderResult};
use crate::terminal::TerminalWrapper;

const DISCOVERY_CHANNEL_CAPACITY: usize = 32;

struct ActiveDiscovery {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Reader connection state machine.
pub struct ConnectionManager {
    terminal: TerminalWrapper,
    status_tx: watch::Sender<ConnectionStatus>,
    battery_tx: watch::Sender<BatteryStatus>,
    messages_tx: watch::Sender<ReaderMessage>,
    discovery: Mutex<Option<ActiveDiscovery>>,
    /// Serializes connect and disconnect.
    connect_lock: Mutex<()>,
    connect_cancel: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(terminal: TerminalWrapper) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::NotConnected);
        let (battery_tx, _) = watch::channel(BatteryStatus::Unknown);
        let (messages_tx, _) = watch::channel(ReaderMessage::NoMessage);

        Self {
            terminal,
            status_tx,
            battery_tx,
            messages_tx,
            discovery: Mutex::new(None),
            connect_lock: Mutex::new(()),
            connect_cancel: Mutex::new(None),
        }
    }

    // =========================================================================
    // Observables
    // =========================================================================

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_battery(&self) -> watch::Receiver<BatteryStatus> {
        self.battery_tx.subscribe()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<ReaderMessage> {
        self.messages_tx.subscribe()
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Starts a fresh discovery sequence, cancelling any active one first.
    ///
    /// The superseded sequence ends with `Failed("cancelled")`.
    pub async fn discover_readers(
        &self,
        request: DiscoveryRequest,
    ) -> BoxStream<'static, DiscoveryEvent> {
        let mut active = self.discovery.lock().await;
        if let Some(previous) = active.take() {
            debug!("Cancelling previous discovery");
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        let (tx, rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let action = DiscoveryAction::new(self.terminal.clone());
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { action.run(request, tx, cancel).await }
        });
        *active = Some(ActiveDiscovery { cancel, task });

        ReceiverStream::new(rx).boxed()
    }

    /// Cancels the active discovery, if any.
    pub async fn cancel_discovery(&self) {
        if let Some(active) = self.discovery.lock().await.take() {
            active.cancel.cancel();
            let _ = active.task.await;
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects to `reader`, tearing down the current connection first.
    ///
    /// On failure the status is `NotConnected` and the error is returned.
    /// If the current reader cannot be disconnected, it stays `Connected`.
    pub async fn start_connection_to_reader(
        &self,
        reader: Reader,
        location_id: &str,
    ) -> ReaderResult<Reader> {
        let _guard = self.connect_lock.lock().await;

        if let ConnectionStatus::Connected(current) = self.status() {
            info!(
                current = %current.display_name(),
                next = %reader.display_name(),
                "Disconnecting current reader before connecting"
            );
            if let Err(e) = self.terminal.disconnect_reader().await {
                warn!(code = %e.code, message = %e.message, "Could not disconnect current reader");
                return Err(ReaderError::DisconnectFailed(e.message));
            }
            self.set_status(ConnectionStatus::NotConnected);
        }

        let cancel = CancellationToken::new();
        *self.connect_cancel.lock().await = Some(cancel.clone());
        self.set_status(ConnectionStatus::Connecting);
        info!(reader = %reader.display_name(), location_id, "Connecting to reader");

        let result = self
            .terminal
            .connect_reader(&reader, location_id, cancel)
            .await;
        self.connect_cancel.lock().await.take();

        match result {
            Ok(connected) => {
                info!(reader = %connected.display_name(), "Reader connected");
                self.set_status(ConnectionStatus::Connected(connected.clone()));
                Ok(connected)
            }
            Err(e) => {
                self.set_status(ConnectionStatus::NotConnected);
                if e.code == TerminalErrorCode::RequestTimedOut {
                    warn!(reader = %reader.display_name(), "Reader connection timed out");
                    return Err(ReaderError::Timeout(self.terminal.timeouts().connect.as_secs()));
                }
                warn!(code = %e.code, message = %e.message, "Reader connection failed");
                Err(e.into())
            }
        }
    }

    /// Asks the transport to abandon an in-flight connection attempt.
    ///
    /// Returns true if an attempt was in flight.
    pub async fn cancel_connection_attempt(&self) -> bool {
        match self.connect_cancel.lock().await.as_ref() {
            Some(cancel) => {
                info!("Cancelling reader connection attempt");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Disconnects the current reader. Succeeds trivially when no reader is
    /// connected.
    pub async fn disconnect_reader(&self) -> bool {
        self.cancel_connection_attempt().await;
        let _guard = self.connect_lock.lock().await;

        if !self.status().is_connected() {
            debug!("Disconnect requested with no reader connected");
            return true;
        }

        match self.terminal.disconnect_reader().await {
            Ok(()) => {
                info!("Reader disconnected");
                self.set_status(ConnectionStatus::NotConnected);
                true
            }
            Err(e) => {
                warn!(code = %e.code, message = %e.message, "Reader disconnect failed");
                false
            }
        }
    }

    /// Handles the transport reporting a lost physical link.
    pub fn handle_unexpected_disconnect(&self) {
        let was_connected = self.status_tx.send_if_modified(|status| {
            if status.is_connected() {
                *status = ConnectionStatus::NotConnected;
                true
            } else {
                false
            }
        });
        if was_connected {
            warn!("Reader link lost");
            self.reset_reader_observables();
        }
    }

    // =========================================================================
    // Reader Observables
    // =========================================================================

    pub fn update_battery(&self, level: f32, is_charging: bool) {
        let level = level.clamp(0.0, 1.0);
        let band = BatteryLevelBand::from_level(level);
        debug!(level, ?band, is_charging, "Battery status changed");
        self.battery_tx.send_replace(BatteryStatus::StatusChanged {
            level,
            band,
            is_charging,
        });
    }

    pub fn battery_warning(&self) {
        warn!("Reader battery low");
        self.battery_tx.send_replace(BatteryStatus::Warning);
    }

    pub fn publish_message(&self, message: ReaderMessage) {
        self.messages_tx.send_replace(message);
    }

    /// Battery level of the connected reader, from the latest report.
    pub fn battery_level(&self) -> Option<f32> {
        match &*self.battery_tx.borrow() {
            BatteryStatus::StatusChanged { level, .. } => Some(*level),
            _ => self
                .status_tx
                .borrow()
                .connected_reader()
                .and_then(|r| r.battery_level),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        debug!(status = %status, "Connection status changed");
        let not_connected = status == ConnectionStatus::NotConnected;
        self.status_tx.send_replace(status);
        if not_connected {
            self.reset_reader_observables();
        }
    }

    fn reset_reader_observables(&self) {
        self.battery_tx.send_replace(BatteryStatus::Unknown);
        self.messages_tx.send_replace(ReaderMessage::NoMessage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{SimulatedTerminal, TerminalCall, TransportTimeouts};
    use cardreader_core::{ReaderType, ReaderTypesToDiscover, TerminalError};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn reader(id: &str) -> Reader {
        Reader::new(Some(id.to_string()), ReaderType::StripeM2, Utc::now())
    }

    fn manager(terminal: SimulatedTerminal) -> (Arc<ConnectionManager>, Arc<SimulatedTerminal>) {
        let terminal = Arc::new(terminal);
        let wrapper = TerminalWrapper::new(terminal.clone(), TransportTimeouts::default());
        (Arc::new(ConnectionManager::new(wrapper)), terminal)
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (manager, _) = manager(SimulatedTerminal::builder().build());
        assert_eq!(manager.status(), ConnectionStatus::NotConnected);

        let connected = manager
            .start_connection_to_reader(reader("A"), "tml_1")
            .await
            .unwrap();
        assert_eq!(connected.location_id.as_deref(), Some("tml_1"));
        assert!(manager.status().is_connected());

        assert!(manager.disconnect_reader().await);
        assert_eq!(manager.status(), ConnectionStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_noop_success() {
        let (manager, terminal) = manager(SimulatedTerminal::builder().build());
        assert!(manager.disconnect_reader().await);
        assert!(terminal.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_connection_disconnects_first() {
        let (manager, terminal) = manager(SimulatedTerminal::builder().build());

        manager.start_connection_to_reader(reader("A"), "tml_1").await.unwrap();
        manager.start_connection_to_reader(reader("B"), "tml_1").await.unwrap();

        assert_eq!(
            terminal.calls().await,
            vec![
                TerminalCall::ConnectReader,
                TerminalCall::DisconnectReader,
                TerminalCall::ConnectReader,
            ]
        );
        let status = manager.status();
        assert_eq!(status.connected_reader().and_then(|r| r.id.as_deref()), Some("B"));
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_current_reader() {
        let (manager, terminal) = manager(
            SimulatedTerminal::builder()
                .disconnect_error(TerminalError::new(TerminalErrorCode::ReaderBusy, "busy"))
                .build(),
        );
        manager.start_connection_to_reader(reader("A"), "tml_1").await.unwrap();

        let err = manager
            .start_connection_to_reader(reader("B"), "tml_1")
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::DisconnectFailed(_)));
        assert_eq!(
            manager.status().connected_reader().and_then(|r| r.id.clone()),
            Some("A".to_string())
        );
        assert_eq!(terminal.call_count(TerminalCall::ConnectReader).await, 1);
    }

    #[tokio::test]
    async fn test_connection_failure_leaves_not_connected() {
        let (manager, _) = manager(
            SimulatedTerminal::builder()
                .connect_error(TerminalError::new(
                    TerminalErrorCode::Other("LOCATION_MISMATCH".into()),
                    "reader registered elsewhere",
                ))
                .build(),
        );

        let err = manager
            .start_connection_to_reader(reader("A"), "tml_1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reader registered elsewhere"));
        assert_eq!(manager.status(), ConnectionStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_cancel_connection_attempt() {
        let (manager, _) = manager(SimulatedTerminal::builder().connect_hangs().build());
        let mut status = manager.subscribe_status();

        let attempt = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start_connection_to_reader(reader("A"), "tml_1").await })
        };
        status
            .wait_for(|s| *s == ConnectionStatus::Connecting)
            .await
            .unwrap();
        assert!(manager.cancel_connection_attempt().await);

        let result = attempt.await.unwrap();
        assert!(matches!(result, Err(ReaderError::ConnectionCancelled)));
        assert_eq!(manager.status(), ConnectionStatus::NotConnected);
        assert!(!manager.cancel_connection_attempt().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_timeout() {
        let terminal = Arc::new(SimulatedTerminal::builder().connect_hangs().build());
        let timeouts = TransportTimeouts {
            connect: Duration::from_secs(10),
            ..TransportTimeouts::default()
        };
        let manager = ConnectionManager::new(TerminalWrapper::new(terminal, timeouts));

        let err = manager
            .start_connection_to_reader(reader("A"), "tml_1")
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Timeout(10)));
        assert_eq!(manager.status(), ConnectionStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_link_loss_resets_reader_observables() {
        let (manager, terminal) = manager(SimulatedTerminal::builder().build());
        manager.start_connection_to_reader(reader("A"), "tml_1").await.unwrap();
        manager.update_battery(0.15, false);
        assert!(matches!(
            *manager.subscribe_battery().borrow(),
            BatteryStatus::StatusChanged {
                band: BatteryLevelBand::Low,
                ..
            }
        ));

        terminal.simulate_link_loss().await;
        manager.handle_unexpected_disconnect();

        assert_eq!(manager.status(), ConnectionStatus::NotConnected);
        assert_eq!(*manager.subscribe_battery().borrow(), BatteryStatus::Unknown);
    }

    #[tokio::test]
    async fn test_new_discovery_supersedes_previous() {
        let (manager, _) = manager(SimulatedTerminal::builder().discovery_hangs().build());
        let request = DiscoveryRequest {
            simulated: true,
            reader_types: ReaderTypesToDiscover::Unspecified,
        };

        let mut first = manager.discover_readers(request.clone()).await;
        assert_eq!(first.next().await, Some(DiscoveryEvent::Started));

        let mut second = manager.discover_readers(request).await;
        assert_eq!(
            first.next().await,
            Some(DiscoveryEvent::Failed("cancelled".into()))
        );
        assert_eq!(first.next().await, None);
        assert_eq!(second.next().await, Some(DiscoveryEvent::Started));

        manager.cancel_discovery().await;
        assert!(second.next().await.unwrap().is_terminal());
        assert_eq!(second.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undrained_discovery_does_not_block_the_next_one() {
        let (manager, _) = manager(
            SimulatedTerminal::builder()
                .readers(vec![reader("A")])
                .discovery_updates(DISCOVERY_CHANNEL_CAPACITY + 8)
                .discovery_hangs()
                .build(),
        );
        let request = DiscoveryRequest {
            simulated: true,
            reader_types: ReaderTypesToDiscover::Unspecified,
        };

        // Held but never read, so its channel fills up.
        let first = manager.discover_readers(request.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut second = tokio::time::timeout(
            Duration::from_secs(3),
            manager.discover_readers(request),
        )
        .await
        .expect("new discovery waited on the undrained stream");
        assert_eq!(second.next().await, Some(DiscoveryEvent::Started));

        let stale: Vec<DiscoveryEvent> =
            tokio::time::timeout(Duration::from_secs(3), first.collect())
                .await
                .unwrap();
        assert_eq!(stale.first(), Some(&DiscoveryEvent::Started));
        assert!(stale.len() <= DISCOVERY_CHANNEL_CAPACITY);
        assert!(!stale.contains(&DiscoveryEvent::Succeeded));

        manager.cancel_discovery().await;
    }
}
