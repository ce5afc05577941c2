//! # Discovery Action
//!
//! Turns one vendor discovery scan into an ordered, finite event sequence.
//!
//! ## Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Started ──► ReadersFound(list)* ──┬──► Succeeded                      │
//! │                                     └──► Failed(reason)                 │
//! │                                                                         │
//! │   • exactly one terminal event, always last                            │
//! │   • a cancelled scan ends with Failed("cancelled")                     │
//! │   • empty lists are not reported                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cardreader_core::{DiscoveryEvent, DiscoveryRequest, Reader};

use crate::terminal::TerminalWrapper;

/// Reason reported when a scan is cancelled or superseded.
pub const DISCOVERY_CANCELLED: &str = "cancelled";

const FOUND_CHANNEL_CAPACITY: usize = 16;

/// Runs a single discovery scan.
pub struct DiscoveryAction {
    terminal: TerminalWrapper,
}

impl DiscoveryAction {
    pub fn new(terminal: TerminalWrapper) -> Self {
        Self { terminal }
    }

    /// Scans until the vendor finishes, fails, or `cancel` fires, pushing
    /// events into `events`. Returns once the terminal event is sent. A
    /// cancelled scan never waits on a full stream.
    pub async fn run(
        &self,
        request: DiscoveryRequest,
        events: mpsc::Sender<DiscoveryEvent>,
        cancel: CancellationToken,
    ) {
        info!(simulated = request.simulated, "Reader discovery started");
        // The channel is fresh, so this never waits.
        if events.send(DiscoveryEvent::Started).await.is_err() {
            return;
        }

        let (found_tx, mut found_rx) = mpsc::channel::<Vec<Reader>>(FOUND_CHANNEL_CAPACITY);
        let mut scan = Box::pin(
            self.terminal
                .discover_readers(request, found_tx, cancel.clone()),
        );

        let result = loop {
            tokio::select! {
                biased;
                Some(readers) = found_rx.recv() => {
                    if !forward_found(&events, readers, &cancel).await {
                        // Nobody is listening any more, or a newer scan took over.
                        cancel.cancel();
                    }
                }
                result = &mut scan => break result,
            }
        };
        drop(scan);

        while let Ok(readers) = found_rx.try_recv() {
            if !forward_found(&events, readers, &cancel).await {
                break;
            }
        }

        if cancel.is_cancelled() || matches!(&result, Err(e) if e.is_cancellation()) {
            debug!("Reader discovery cancelled");
            // A superseded stream may be full and unread; never wait on it.
            if events
                .try_send(DiscoveryEvent::Failed(DISCOVERY_CANCELLED.to_string()))
                .is_err()
            {
                debug!("Dropped cancelled event for an undrained discovery stream");
            }
            return;
        }

        let terminal_event = match result {
            Ok(()) => DiscoveryEvent::Succeeded,
            Err(e) => {
                warn!(code = %e.code, message = %e.message, "Reader discovery failed");
                DiscoveryEvent::Failed(e.message)
            }
        };
        debug!(event = ?terminal_event, "Reader discovery finished");
        if !deliver(&events, terminal_event, &cancel).await {
            let _ = events.try_send(DiscoveryEvent::Failed(DISCOVERY_CANCELLED.to_string()));
        }
    }
}

/// Sends one event unless the scan is cancelled first.
///
/// Returns false when the event was not delivered.
async fn deliver(
    events: &mpsc::Sender<DiscoveryEvent>,
    event: DiscoveryEvent,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn forward_found(
    events: &mpsc::Sender<DiscoveryEvent>,
    readers: Vec<Reader>,
    cancel: &CancellationToken,
) -> bool {
    if readers.is_empty() {
        return true;
    }
    debug!(count = readers.len(), "Readers found");
    deliver(events, DiscoveryEvent::ReadersFound(readers), cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{SimulatedTerminal, TransportTimeouts};
    use cardreader_core::{ReaderType, ReaderTypesToDiscover, TerminalError, TerminalErrorCode};
    use chrono::Utc;
    use std::sync::Arc;

    async fn run_to_end(terminal: SimulatedTerminal, request: DiscoveryRequest) -> Vec<DiscoveryEvent> {
        let wrapper = TerminalWrapper::new(Arc::new(terminal), TransportTimeouts::default());
        let (tx, mut rx) = mpsc::channel(16);
        DiscoveryAction::new(wrapper)
            .run(request, tx, CancellationToken::new())
            .await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn simulated() -> DiscoveryRequest {
        DiscoveryRequest {
            simulated: true,
            reader_types: ReaderTypesToDiscover::Unspecified,
        }
    }

    #[tokio::test]
    async fn test_empty_simulated_environment() {
        let events = run_to_end(SimulatedTerminal::builder().build(), simulated()).await;
        assert_eq!(events, vec![DiscoveryEvent::Started, DiscoveryEvent::Succeeded]);
    }

    #[tokio::test]
    async fn test_found_readers_precede_single_terminal_event() {
        let reader = Reader::new(Some("SIM-1".into()), ReaderType::WisePade3, Utc::now());
        let terminal = SimulatedTerminal::builder().readers(vec![reader.clone()]).build();

        let events = run_to_end(terminal, simulated()).await;
        assert_eq!(
            events,
            vec![
                DiscoveryEvent::Started,
                DiscoveryEvent::ReadersFound(vec![reader]),
                DiscoveryEvent::Succeeded,
            ]
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_reader_type_filter() {
        let reader = Reader::new(Some("SIM-1".into()), ReaderType::Chipper2X, Utc::now());
        let terminal = SimulatedTerminal::builder().readers(vec![reader]).build();
        let request = DiscoveryRequest {
            simulated: true,
            reader_types: ReaderTypesToDiscover::SpecificReaders(vec![ReaderType::StripeM2]),
        };

        let events = run_to_end(terminal, request).await;
        assert_eq!(events, vec![DiscoveryEvent::Started, DiscoveryEvent::Succeeded]);
    }

    #[tokio::test]
    async fn test_scan_failure() {
        let terminal = SimulatedTerminal::builder()
            .discovery_error(TerminalError::new(
                TerminalErrorCode::Other("BLUETOOTH_DISABLED".into()),
                "Bluetooth is turned off",
            ))
            .build();

        let events = run_to_end(terminal, simulated()).await;
        assert_eq!(
            events.last(),
            Some(&DiscoveryEvent::Failed("Bluetooth is turned off".into()))
        );
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_scan_reports_cancelled() {
        let terminal = SimulatedTerminal::builder().discovery_hangs().build();
        let wrapper = TerminalWrapper::new(Arc::new(terminal), TransportTimeouts::default());
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                DiscoveryAction::new(wrapper).run(simulated(), tx, cancel).await;
            })
        };
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Started));
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(DiscoveryEvent::Failed(DISCOVERY_CANCELLED.into()))
        );
        assert_eq!(rx.recv().await, None);
    }
}
