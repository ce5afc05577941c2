//! # Simulated Terminal
//!
//! In-process scripted [`Terminal`] used by the tests and by the
//! `cardreader-sim` binary. Also hosts [`SimulatedBackend`], an in-memory
//! credential store and capture collaborator.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  SimulatedTerminal::builder()                                │
//! │      .readers(vec![...])            discovery results        │
//! │      .collect_error(declined)       queued per-call failures │
//! │      .pending_update(update)        firmware check result    │
//! │      .install_progress(vec![...])   progress reported        │
//! │      .build()                                                │
//! │                                                              │
//! │  calls().await  →  ordered log of every vendor call          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cardreader_core::{
    CaptureOutcome, DiscoveryRequest, PaymentIntent, PaymentIntentParams, PaymentIntentStatus,
    Reader, ReaderInputOption, ReaderSoftwareUpdate, Refund, RefundParams, RefundStatus,
    TerminalError, TerminalErrorCode,
};

use super::{ConnectionTokenSource, Terminal, TerminalEvent, TerminalResult};
use crate::error::{ReaderError, ReaderResult};
use crate::payments::PaymentCapturer;
use crate::token::CredentialStore;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One recorded vendor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalCall {
    Initialize,
    DiscoverReaders,
    ConnectReader,
    DisconnectReader,
    CreatePaymentIntent,
    CollectPaymentMethod,
    ProcessPayment,
    CancelPaymentIntent,
    CollectRefundPaymentMethod,
    ProcessRefund,
    CheckForUpdate,
    InstallUpdate,
}

// =============================================================================
// Script
// =============================================================================

#[derive(Debug, Default)]
struct SimulationScript {
    readers: Vec<Reader>,
    discovery_error: Option<TerminalError>,
    discovery_hangs: bool,
    discovery_updates: usize,

    connect_error: Option<TerminalError>,
    connect_hangs: bool,
    disconnect_errors: VecDeque<TerminalError>,

    create_errors: VecDeque<TerminalError>,
    collect_errors: VecDeque<TerminalError>,
    collect_prompts: Vec<TerminalEvent>,
    collect_waits_for_cancel: bool,
    process_errors: VecDeque<TerminalError>,
    process_status: Option<PaymentIntentStatus>,
    step_delay: Duration,

    refund_collect_errors: VecDeque<TerminalError>,
    refund_process_errors: VecDeque<TerminalError>,
    refund_status: Option<RefundStatus>,

    pending_update: Option<ReaderSoftwareUpdate>,
    check_error: Option<TerminalError>,
    check_delay: Duration,
    install_progress: Vec<f32>,
    install_error: Option<TerminalError>,
    install_step_delay: Duration,
}

/// Builder for [`SimulatedTerminal`].
#[derive(Default)]
pub struct SimulatedTerminalBuilder {
    script: SimulationScript,
}

impl SimulatedTerminalBuilder {
    /// Readers reported by every discovery.
    pub fn readers(mut self, readers: Vec<Reader>) -> Self {
        self.script.readers = readers;
        self
    }

    pub fn discovery_error(mut self, error: TerminalError) -> Self {
        self.script.discovery_error = Some(error);
        self
    }

    /// Discovery keeps scanning until cancelled.
    pub fn discovery_hangs(mut self) -> Self {
        self.script.discovery_hangs = true;
        self
    }

    /// Number of times each discovery re-reports the reader list.
    pub fn discovery_updates(mut self, updates: usize) -> Self {
        self.script.discovery_updates = updates;
        self
    }

    pub fn connect_error(mut self, error: TerminalError) -> Self {
        self.script.connect_error = Some(error);
        self
    }

    /// Connecting never completes until cancelled.
    pub fn connect_hangs(mut self) -> Self {
        self.script.connect_hangs = true;
        self
    }

    /// Fails the next disconnect.
    pub fn disconnect_error(mut self, error: TerminalError) -> Self {
        self.script.disconnect_errors.push_back(error);
        self
    }

    /// Fails the next intent creation.
    pub fn create_error(mut self, error: TerminalError) -> Self {
        self.script.create_errors.push_back(error);
        self
    }

    /// Fails the next card collection.
    pub fn collect_error(mut self, error: TerminalError) -> Self {
        self.script.collect_errors.push_back(error);
        self
    }

    /// Extra reader prompt raised during every collection.
    pub fn collect_prompt(mut self, event: TerminalEvent) -> Self {
        self.script.collect_prompts.push(event);
        self
    }

    /// Card collection waits for the customer until cancelled.
    pub fn collect_waits_for_cancel(mut self) -> Self {
        self.script.collect_waits_for_cancel = true;
        self
    }

    /// Fails the next processing call.
    pub fn process_error(mut self, error: TerminalError) -> Self {
        self.script.process_errors.push_back(error);
        self
    }

    /// Intent status reported after processing (default `RequiresCapture`).
    pub fn process_status(mut self, status: PaymentIntentStatus) -> Self {
        self.script.process_status = Some(status);
        self
    }

    /// Delay inside collect and process, to widen cancellation windows.
    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.script.step_delay = delay;
        self
    }

    /// Fails the next refund card collection.
    pub fn refund_collect_error(mut self, error: TerminalError) -> Self {
        self.script.refund_collect_errors.push_back(error);
        self
    }

    /// Fails the next refund processing call.
    pub fn refund_process_error(mut self, error: TerminalError) -> Self {
        self.script.refund_process_errors.push_back(error);
        self
    }

    /// Refund status reported after processing (default `Succeeded`).
    pub fn refund_status(mut self, status: RefundStatus) -> Self {
        self.script.refund_status = Some(status);
        self
    }

    pub fn pending_update(mut self, update: ReaderSoftwareUpdate) -> Self {
        self.script.pending_update = Some(update);
        self
    }

    pub fn check_error(mut self, error: TerminalError) -> Self {
        self.script.check_error = Some(error);
        self
    }

    /// Time the firmware check takes.
    pub fn check_delay(mut self, delay: Duration) -> Self {
        self.script.check_delay = delay;
        self
    }

    /// Raw progress values reported during an install.
    pub fn install_progress(mut self, steps: Vec<f32>) -> Self {
        self.script.install_progress = steps;
        self
    }

    pub fn install_error(mut self, error: TerminalError) -> Self {
        self.script.install_error = Some(error);
        self
    }

    pub fn install_step_delay(mut self, delay: Duration) -> Self {
        self.script.install_step_delay = delay;
        self
    }

    pub fn build(self) -> SimulatedTerminal {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        SimulatedTerminal {
            script: Mutex::new(self.script),
            events_tx,
            initialized: AtomicBool::new(false),
            token_source: Mutex::new(None),
            connected: Mutex::new(None),
            link: Mutex::new(CancellationToken::new()),
            intent_counter: AtomicU64::new(0),
            collected_refund: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }
}

// =============================================================================
// Simulated Terminal
// =============================================================================

/// Scripted stand-in for the vendor terminal SDK.
pub struct SimulatedTerminal {
    script: Mutex<SimulationScript>,
    events_tx: broadcast::Sender<TerminalEvent>,
    initialized: AtomicBool,
    token_source: Mutex<Option<Arc<dyn ConnectionTokenSource>>>,
    connected: Mutex<Option<Reader>>,
    /// Fires when the current physical link drops.
    link: Mutex<CancellationToken>,
    intent_counter: AtomicU64,
    collected_refund: Mutex<Option<RefundParams>>,
    calls: Mutex<Vec<TerminalCall>>,
}

impl SimulatedTerminal {
    pub fn builder() -> SimulatedTerminalBuilder {
        SimulatedTerminalBuilder::default()
    }

    /// Ordered log of every vendor call made so far.
    pub async fn calls(&self) -> Vec<TerminalCall> {
        self.calls.lock().await.clone()
    }

    /// Number of times a given call was made.
    pub async fn call_count(&self, call: TerminalCall) -> usize {
        self.calls.lock().await.iter().filter(|c| **c == call).count()
    }

    /// Raises an unsolicited SDK notification.
    pub fn emit(&self, event: TerminalEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    /// Drops the physical link without a disconnect request.
    pub async fn simulate_link_loss(&self) {
        info!("Simulated reader link lost");
        *self.connected.lock().await = None;
        self.link.lock().await.cancel();
        self.emit(TerminalEvent::ReaderDisconnected);
    }

    /// Rejects the current connection token and asks the token source for a
    /// fresh one, as the vendor SDK does.
    pub async fn expire_connection_token(&self) -> TerminalResult<String> {
        self.emit(TerminalEvent::ConnectionTokenExpired);
        let source = self.token_source.lock().await.clone();
        match source {
            Some(source) => source.fetch_connection_token().await,
            None => Err(TerminalError::new(
                TerminalErrorCode::Other("NOT_INITIALIZED".into()),
                "terminal is not initialized",
            )),
        }
    }

    pub async fn connected_reader(&self) -> Option<Reader> {
        self.connected.lock().await.clone()
    }

    pub async fn push_collect_error(&self, error: TerminalError) {
        self.script.lock().await.collect_errors.push_back(error);
    }

    pub async fn set_pending_update(&self, update: Option<ReaderSoftwareUpdate>) {
        self.script.lock().await.pending_update = update;
    }

    async fn record(&self, call: TerminalCall) {
        debug!(?call, "Simulated terminal call");
        self.calls.lock().await.push(call);
    }

    async fn require_reader(&self) -> TerminalResult<()> {
        if self.connected.lock().await.is_some() {
            Ok(())
        } else {
            Err(TerminalError::new(
                TerminalErrorCode::NotConnectedToReader,
                "no reader is connected",
            ))
        }
    }
}

/// Waits for `delay`, or fails with a cancellation acknowledgement.
async fn pause_or_cancel(delay: Duration, cancel: &CancellationToken) -> TerminalResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TerminalError::canceled()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn with_intent(error: TerminalError, intent: &PaymentIntent) -> TerminalError {
    if error.payment_intent.is_some() {
        error
    } else {
        error.with_payment_intent(intent.clone())
    }
}

#[async_trait]
impl Terminal for SimulatedTerminal {
    async fn initialize(&self, tokens: Arc<dyn ConnectionTokenSource>) -> TerminalResult<()> {
        self.record(TerminalCall::Initialize).await;
        tokens.fetch_connection_token().await?;
        *self.token_source.lock().await = Some(tokens);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events_tx.subscribe()
    }

    async fn discover_readers(
        &self,
        request: DiscoveryRequest,
        found: mpsc::Sender<Vec<Reader>>,
        cancel: CancellationToken,
    ) -> TerminalResult<()> {
        self.record(TerminalCall::DiscoverReaders).await;
        let (readers, error, hangs, updates) = {
            let script = self.script.lock().await;
            let readers: Vec<Reader> = script
                .readers
                .iter()
                .filter(|r| request.reader_types.includes(r.reader_type))
                .cloned()
                .collect();
            (
                readers,
                script.discovery_error.clone(),
                script.discovery_hangs,
                script.discovery_updates.max(1),
            )
        };

        if let Some(error) = error {
            return Err(error);
        }
        if !readers.is_empty() {
            for _ in 0..updates {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TerminalError::canceled()),
                    sent = found.send(readers.clone()) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        if hangs {
            cancel.cancelled().await;
            return Err(TerminalError::canceled());
        }
        Ok(())
    }

    async fn connect_reader(
        &self,
        reader: &Reader,
        location_id: &str,
        cancel: CancellationToken,
    ) -> TerminalResult<Reader> {
        self.record(TerminalCall::ConnectReader).await;
        let (error, hangs) = {
            let script = self.script.lock().await;
            (script.connect_error.clone(), script.connect_hangs)
        };

        if hangs {
            cancel.cancelled().await;
            return Err(TerminalError::canceled());
        }
        if let Some(error) = error {
            return Err(error);
        }

        let mut connected = reader.clone();
        connected.location_id = Some(location_id.to_string());
        *self.connected.lock().await = Some(connected.clone());
        *self.link.lock().await = CancellationToken::new();

        if let Some(level) = connected.battery_level {
            self.emit(TerminalEvent::BatteryLevelUpdate {
                level,
                is_charging: false,
            });
        }
        Ok(connected)
    }

    async fn disconnect_reader(&self) -> TerminalResult<()> {
        self.record(TerminalCall::DisconnectReader).await;
        if let Some(error) = self.script.lock().await.disconnect_errors.pop_front() {
            return Err(error);
        }
        *self.connected.lock().await = None;
        Ok(())
    }

    async fn create_payment_intent(
        &self,
        params: &PaymentIntentParams,
    ) -> TerminalResult<PaymentIntent> {
        self.record(TerminalCall::CreatePaymentIntent).await;
        if let Some(error) = self.script.lock().await.create_errors.pop_front() {
            return Err(error);
        }

        let n = self.intent_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PaymentIntent {
            id: format!("pi_sim_{}", n),
            status: PaymentIntentStatus::RequiresPaymentMethod,
            amount: params.amount,
            currency: params.currency.clone(),
        })
    }

    async fn collect_payment_method(
        &self,
        intent: PaymentIntent,
        cancel: CancellationToken,
    ) -> TerminalResult<PaymentIntent> {
        self.record(TerminalCall::CollectPaymentMethod).await;
        self.require_reader()
            .await
            .map_err(|e| with_intent(e, &intent))?;

        let (error, prompts, waits, delay) = {
            let mut script = self.script.lock().await;
            (
                script.collect_errors.pop_front(),
                script.collect_prompts.clone(),
                script.collect_waits_for_cancel,
                script.step_delay,
            )
        };

        self.emit(TerminalEvent::ReaderInputRequested(vec![
            ReaderInputOption::Insert,
            ReaderInputOption::Swipe,
            ReaderInputOption::Tap,
        ]));
        for prompt in prompts {
            self.emit(prompt);
        }

        if waits {
            let link = self.link.lock().await.clone();
            let error = tokio::select! {
                _ = cancel.cancelled() => TerminalError::canceled(),
                _ = link.cancelled() => TerminalError::new(
                    TerminalErrorCode::ReaderDisconnected,
                    "reader disconnected during card collection",
                ),
            };
            return Err(with_intent(error, &intent));
        }
        pause_or_cancel(delay, &cancel)
            .await
            .map_err(|e| with_intent(e, &intent))?;

        match error {
            Some(error) => Err(with_intent(error, &intent)),
            None => Ok(intent.with_status(PaymentIntentStatus::RequiresConfirmation)),
        }
    }

    async fn process_payment(&self, intent: PaymentIntent) -> TerminalResult<PaymentIntent> {
        self.record(TerminalCall::ProcessPayment).await;
        let (error, status, delay) = {
            let mut script = self.script.lock().await;
            (
                script.process_errors.pop_front(),
                script.process_status,
                script.step_delay,
            )
        };
        tokio::time::sleep(delay).await;

        match error {
            Some(error) => Err(with_intent(error, &intent)),
            None => Ok(intent.with_status(status.unwrap_or(PaymentIntentStatus::RequiresCapture))),
        }
    }

    async fn cancel_payment_intent(&self, intent: PaymentIntent) -> TerminalResult<PaymentIntent> {
        self.record(TerminalCall::CancelPaymentIntent).await;
        Ok(intent.with_status(PaymentIntentStatus::Canceled))
    }

    async fn collect_refund_payment_method(
        &self,
        params: &RefundParams,
        cancel: CancellationToken,
    ) -> TerminalResult<()> {
        self.record(TerminalCall::CollectRefundPaymentMethod).await;
        self.require_reader().await?;

        let (error, waits, delay) = {
            let mut script = self.script.lock().await;
            (
                script.refund_collect_errors.pop_front(),
                script.collect_waits_for_cancel,
                script.step_delay,
            )
        };
        self.emit(TerminalEvent::ReaderInputRequested(vec![
            ReaderInputOption::Insert,
            ReaderInputOption::Tap,
        ]));

        if waits {
            cancel.cancelled().await;
            return Err(TerminalError::canceled());
        }
        pause_or_cancel(delay, &cancel).await?;
        if let Some(error) = error {
            return Err(error);
        }
        *self.collected_refund.lock().await = Some(params.clone());
        Ok(())
    }

    async fn process_refund(&self) -> TerminalResult<Refund> {
        self.record(TerminalCall::ProcessRefund).await;
        let params = self.collected_refund.lock().await.take().ok_or_else(|| {
            TerminalError::new(
                TerminalErrorCode::Other("NO_REFUND_COLLECTED".into()),
                "no refund payment method was collected",
            )
        })?;
        let (error, status) = {
            let mut script = self.script.lock().await;
            (script.refund_process_errors.pop_front(), script.refund_status)
        };
        if let Some(error) = error {
            return Err(error);
        }

        Ok(Refund {
            id: format!("re_sim_{}", params.charge_id),
            charge_id: params.charge_id,
            amount: params.amount,
            currency: params.currency.to_lowercase(),
            status: status.unwrap_or(RefundStatus::Succeeded),
        })
    }

    async fn check_for_update(&self) -> TerminalResult<Option<ReaderSoftwareUpdate>> {
        self.record(TerminalCall::CheckForUpdate).await;
        let delay = self.script.lock().await.check_delay;
        tokio::time::sleep(delay).await;

        let script = self.script.lock().await;
        match &script.check_error {
            Some(error) => Err(error.clone()),
            None => Ok(script.pending_update.clone()),
        }
    }

    async fn install_update(
        &self,
        update: ReaderSoftwareUpdate,
        progress: mpsc::Sender<f32>,
        cancel: CancellationToken,
    ) -> TerminalResult<()> {
        self.record(TerminalCall::InstallUpdate).await;
        let (steps, error, delay) = {
            let script = self.script.lock().await;
            (
                script.install_progress.clone(),
                script.install_error.clone(),
                script.install_step_delay,
            )
        };
        info!(version = %update.version, "Simulated firmware install started");

        for step in steps {
            pause_or_cancel(delay, &cancel).await?;
            let _ = progress.send(step).await;
        }
        if let Some(error) = error {
            return Err(error);
        }

        self.script.lock().await.pending_update = None;
        Ok(())
    }
}

// =============================================================================
// Simulated Backend
// =============================================================================

/// In-memory credential store and capture collaborator.
#[derive(Default)]
pub struct SimulatedBackend {
    capture_outcomes: Mutex<VecDeque<CaptureOutcome>>,
    captures: Mutex<Vec<(i64, String)>>,
    token_requests: AtomicUsize,
    tokens_unavailable: AtomicBool,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome of the next capture. Unqueued captures succeed.
    pub async fn push_capture_outcome(&self, outcome: CaptureOutcome) {
        self.capture_outcomes.lock().await.push_back(outcome);
    }

    /// Every `(order_id, payment_intent_id)` capture requested so far.
    pub async fn captures(&self) -> Vec<(i64, String)> {
        self.captures.lock().await.clone()
    }

    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }

    pub fn set_tokens_unavailable(&self, unavailable: bool) {
        self.tokens_unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialStore for SimulatedBackend {
    async fn get_connection_token(&self) -> ReaderResult<String> {
        if self.tokens_unavailable.load(Ordering::SeqCst) {
            return Err(ReaderError::CredentialsUnavailable(
                "simulated backend is offline".into(),
            ));
        }
        let n = self.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("pst_sim_{}", n))
    }
}

#[async_trait]
impl PaymentCapturer for SimulatedBackend {
    async fn capture_payment_intent(&self, order_id: i64, payment_intent_id: &str) -> CaptureOutcome {
        self.captures
            .lock()
            .await
            .push((order_id, payment_intent_id.to_string()));
        self.capture_outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or(CaptureOutcome::Success)
    }
}
