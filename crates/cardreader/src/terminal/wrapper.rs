//! # Terminal Wrapper
//!
//! The only holder of the vendor [`Terminal`]. Applies a bounded timeout to
//! every call so a reader that silently drops its link ends the current
//! operation with `RequestTimedOut` instead of hanging.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cardreader_core::{
    DiscoveryRequest, PaymentIntent, PaymentIntentParams, Reader, ReaderSoftwareUpdate, Refund,
    RefundParams, TerminalError,
};

use super::{ConnectionTokenSource, Terminal, TerminalEvent, TerminalResult};
use crate::config::TerminalSettings;

// =============================================================================
// Timeouts
// =============================================================================

/// Per-step bounds for vendor calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimeouts {
    pub initialize: Duration,
    pub discovery: Duration,
    pub connect: Duration,
    pub disconnect: Duration,
    pub create_intent: Duration,
    pub collect: Duration,
    pub process: Duration,
    pub cancel: Duration,
    pub update_check: Duration,
    pub install: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        TransportTimeouts::from(&TerminalSettings::default())
    }
}

impl From<&TerminalSettings> for TransportTimeouts {
    fn from(settings: &TerminalSettings) -> Self {
        TransportTimeouts {
            initialize: Duration::from_secs(settings.connect_timeout_secs),
            discovery: Duration::from_secs(settings.discovery_timeout_secs),
            connect: Duration::from_secs(settings.connect_timeout_secs),
            disconnect: Duration::from_secs(settings.disconnect_timeout_secs),
            create_intent: Duration::from_secs(settings.create_intent_timeout_secs),
            collect: Duration::from_secs(settings.collect_timeout_secs),
            process: Duration::from_secs(settings.process_timeout_secs),
            cancel: Duration::from_secs(settings.cancel_timeout_secs),
            update_check: Duration::from_secs(settings.update_check_timeout_secs),
            install: Duration::from_secs(settings.install_timeout_secs),
        }
    }
}

// =============================================================================
// Wrapper
// =============================================================================

/// Bounded access to the vendor terminal. Cheap to clone.
#[derive(Clone)]
pub struct TerminalWrapper {
    terminal: Arc<dyn Terminal>,
    timeouts: TransportTimeouts,
}

impl TerminalWrapper {
    pub fn new(terminal: Arc<dyn Terminal>, timeouts: TransportTimeouts) -> Self {
        Self { terminal, timeouts }
    }

    pub fn timeouts(&self) -> &TransportTimeouts {
        &self.timeouts
    }

    pub fn is_initialized(&self) -> bool {
        self.terminal.is_initialized()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.terminal.subscribe()
    }

    pub async fn initialize(&self, tokens: Arc<dyn ConnectionTokenSource>) -> TerminalResult<()> {
        bounded("initialize", self.timeouts.initialize, self.terminal.initialize(tokens)).await
    }

    pub async fn discover_readers(
        &self,
        request: DiscoveryRequest,
        found: mpsc::Sender<Vec<Reader>>,
        cancel: CancellationToken,
    ) -> TerminalResult<()> {
        bounded(
            "discover_readers",
            self.timeouts.discovery,
            self.terminal.discover_readers(request, found, cancel),
        )
        .await
    }

    pub async fn connect_reader(
        &self,
        reader: &Reader,
        location_id: &str,
        cancel: CancellationToken,
    ) -> TerminalResult<Reader> {
        bounded(
            "connect_reader",
            self.timeouts.connect,
            self.terminal.connect_reader(reader, location_id, cancel),
        )
        .await
    }

    pub async fn disconnect_reader(&self) -> TerminalResult<()> {
        bounded(
            "disconnect_reader",
            self.timeouts.disconnect,
            self.terminal.disconnect_reader(),
        )
        .await
    }

    pub async fn create_payment_intent(
        &self,
        params: &PaymentIntentParams,
    ) -> TerminalResult<PaymentIntent> {
        bounded(
            "create_payment_intent",
            self.timeouts.create_intent,
            self.terminal.create_payment_intent(params),
        )
        .await
    }

    pub async fn collect_payment_method(
        &self,
        intent: PaymentIntent,
        cancel: CancellationToken,
    ) -> TerminalResult<PaymentIntent> {
        // Time out with the intent attached so the failure stays retryable.
        let fallback = intent.clone();
        bounded(
            "collect_payment_method",
            self.timeouts.collect,
            self.terminal.collect_payment_method(intent, cancel),
        )
        .await
        .map_err(|e| attach_intent(e, fallback))
    }

    pub async fn process_payment(&self, intent: PaymentIntent) -> TerminalResult<PaymentIntent> {
        let fallback = intent.clone();
        bounded(
            "process_payment",
            self.timeouts.process,
            self.terminal.process_payment(intent),
        )
        .await
        .map_err(|e| attach_intent(e, fallback))
    }

    pub async fn cancel_payment_intent(
        &self,
        intent: PaymentIntent,
    ) -> TerminalResult<PaymentIntent> {
        bounded(
            "cancel_payment_intent",
            self.timeouts.cancel,
            self.terminal.cancel_payment_intent(intent),
        )
        .await
    }

    pub async fn collect_refund_payment_method(
        &self,
        params: &RefundParams,
        cancel: CancellationToken,
    ) -> TerminalResult<()> {
        bounded(
            "collect_refund_payment_method",
            self.timeouts.collect,
            self.terminal.collect_refund_payment_method(params, cancel),
        )
        .await
    }

    pub async fn process_refund(&self) -> TerminalResult<Refund> {
        bounded("process_refund", self.timeouts.process, self.terminal.process_refund()).await
    }

    pub async fn check_for_update(&self) -> TerminalResult<Option<ReaderSoftwareUpdate>> {
        bounded(
            "check_for_update",
            self.timeouts.update_check,
            self.terminal.check_for_update(),
        )
        .await
    }

    pub async fn install_update(
        &self,
        update: ReaderSoftwareUpdate,
        progress: mpsc::Sender<f32>,
        cancel: CancellationToken,
    ) -> TerminalResult<()> {
        bounded(
            "install_update",
            self.timeouts.install,
            self.terminal.install_update(update, progress, cancel),
        )
        .await
    }
}

/// Runs a vendor call with an upper bound.
async fn bounded<T, F>(step: &str, limit: Duration, call: F) -> TerminalResult<T>
where
    F: Future<Output = TerminalResult<T>>,
{
    debug!(step, "Terminal call started");
    match timeout(limit, call).await {
        Ok(Ok(value)) => {
            debug!(step, "Terminal call succeeded");
            Ok(value)
        }
        Ok(Err(e)) => {
            debug!(step, code = %e.code, message = %e.message, "Terminal call failed");
            Err(e)
        }
        Err(_) => {
            warn!(step, limit_secs = limit.as_secs(), "Terminal call timed out");
            Err(TerminalError::timed_out(step, limit.as_secs()))
        }
    }
}

fn attach_intent(error: TerminalError, intent: PaymentIntent) -> TerminalError {
    if error.payment_intent.is_some() {
        error
    } else {
        error.with_payment_intent(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::SimulatedTerminal;
    use cardreader_core::{Money, PaymentIntentStatus, ReaderType, TerminalErrorCode};

    fn intent() -> PaymentIntent {
        PaymentIntent {
            id: "pi_test".into(),
            status: PaymentIntentStatus::RequiresPaymentMethod,
            amount: Money::from_minor_units(500),
            currency: "usd".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_collect_times_out_with_intent() {
        let terminal = SimulatedTerminal::builder().collect_waits_for_cancel().build();
        let reader = Reader::new(Some("SIM-1".into()), ReaderType::StripeM2, chrono::Utc::now());
        terminal
            .connect_reader(&reader, "tml_1", CancellationToken::new())
            .await
            .unwrap();
        let timeouts = TransportTimeouts {
            collect: Duration::from_secs(5),
            ..TransportTimeouts::default()
        };
        let wrapper = TerminalWrapper::new(Arc::new(terminal), timeouts);

        let err = wrapper
            .collect_payment_method(intent(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.code, TerminalErrorCode::RequestTimedOut);
        assert_eq!(err.payment_intent.map(|i| i.id).as_deref(), Some("pi_test"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_call_is_not_affected() {
        let wrapper = TerminalWrapper::new(
            Arc::new(SimulatedTerminal::builder().build()),
            TransportTimeouts::default(),
        );
        assert!(wrapper.check_for_update().await.unwrap().is_none());
    }

    #[test]
    fn test_timeouts_from_settings() {
        let settings = TerminalSettings {
            collect_timeout_secs: 7,
            ..TerminalSettings::default()
        };
        let timeouts = TransportTimeouts::from(&settings);
        assert_eq!(timeouts.collect, Duration::from_secs(7));
        assert_eq!(timeouts.install, Duration::from_secs(20 * 60));
    }
}
