//! # Payment Manager
//!
//! Runs payment attempts and keeps a session arena keyed by the opaque
//! [`PaymentData`] handle.
//!
//! ## Attempt Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  collect_payment ──► session(running) ──► step fails ──► session(idle) │
//! │                            │                                  │         │
//! │                            │ completes / fatal                │ retry   │
//! │                            ▼                                  ▼         │
//! │                        (removed)              handle consumed, new      │
//! │                                               session resumes at the    │
//! │                                               step the intent needs     │
//! │                                                                         │
//! │  Resume point by intent status:                                        │
//! │    no intent               → create                                    │
//! │    REQUIRES_PAYMENT_METHOD → collect                                   │
//! │    REQUIRES_CONFIRMATION   → process                                   │
//! │    PROCESSING              → process                                   │
//! │    REQUIRES_CAPTURE        → capture only                              │
//! │    SUCCEEDED / CANCELED    → NothingToRetry                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cancellation is honoured until the attempt enters processing. From then
//! on the card network owns the outcome and the attempt runs to its end.

use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cardreader_core::error_mapper::{map_capture_outcome, map_terminal_error};
use cardreader_core::validation::validate_payment_info;
use cardreader_core::{
    CaptureOutcome, CardPaymentStatus, CardPaymentStatusErrorType, ConnectionStatus, CoreError,
    Declined, PaymentData, PaymentFailure, PaymentInfo, PaymentIntent, PaymentIntentParams,
    PaymentIntentStatus,
};

use super::actions::{
    CancelPaymentAction, CollectPaymentAction, CreatePaymentAction, ProcessPaymentAction,
};
use super::PaymentCapturer;
use crate::config::PaymentSettings;
use crate::gate::OperationGuard;
use crate::terminal::TerminalWrapper;

const PAYMENT_CHANNEL_CAPACITY: usize = 32;

// =============================================================================
// Stages
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PaymentStage {
    Initializing,
    Collecting,
    Processing,
    Capturing,
}

impl PaymentStage {
    fn failed(self, failure: PaymentFailure) -> CardPaymentStatus {
        match self {
            PaymentStage::Initializing => CardPaymentStatus::InitializingPaymentFailed(failure),
            PaymentStage::Collecting => CardPaymentStatus::CollectingPaymentFailed(failure),
            PaymentStage::Processing => CardPaymentStatus::ProcessingPaymentFailed(failure),
            PaymentStage::Capturing => CardPaymentStatus::CapturingPaymentFailed(failure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ResumePoint {
    Create,
    Collect,
    Process,
    Capture,
}

impl ResumePoint {
    /// Where an attempt holding `intent` must resume, or `None` if the
    /// intent is already final.
    fn for_intent(intent: Option<&PaymentIntent>) -> Option<Self> {
        match intent.map(|i| i.status) {
            None => Some(ResumePoint::Create),
            Some(PaymentIntentStatus::RequiresPaymentMethod) => Some(ResumePoint::Collect),
            Some(PaymentIntentStatus::RequiresConfirmation)
            | Some(PaymentIntentStatus::Processing) => Some(ResumePoint::Process),
            Some(PaymentIntentStatus::RequiresCapture) => Some(ResumePoint::Capture),
            Some(PaymentIntentStatus::Succeeded) | Some(PaymentIntentStatus::Canceled) => None,
        }
    }

    fn stage(self) -> PaymentStage {
        match self {
            ResumePoint::Create => PaymentStage::Initializing,
            ResumePoint::Collect => PaymentStage::Collecting,
            ResumePoint::Process => PaymentStage::Processing,
            ResumePoint::Capture => PaymentStage::Capturing,
        }
    }
}

// =============================================================================
// Sessions
// =============================================================================

struct PaymentSession {
    payment_data: PaymentData,
    info: PaymentInfo,
    intent: Option<PaymentIntent>,
    stage: PaymentStage,
    cancel: CancellationToken,
    running: bool,
    task: Option<JoinHandle<()>>,
}

type Sessions = Arc<Mutex<HashMap<Uuid, PaymentSession>>>;

/// Everything a running attempt needs. Cheap to clone.
#[derive(Clone)]
struct PaymentSteps {
    create: CreatePaymentAction,
    collect: CollectPaymentAction,
    process: ProcessPaymentAction,
    cancel: CancelPaymentAction,
    capturer: Arc<dyn PaymentCapturer>,
    capture_timeout: Duration,
    sessions: Sessions,
}

impl PaymentSteps {
    async fn cancel_intent(&self, intent: PaymentIntent) {
        if matches!(
            intent.status,
            PaymentIntentStatus::Succeeded | PaymentIntentStatus::Canceled
        ) {
            return;
        }
        let intent_id = intent.id.clone();
        match self.cancel.run(intent).await {
            Ok(_) => info!(intent_id = %intent_id, "Payment intent cancelled"),
            Err(e) => warn!(intent_id = %intent_id, code = %e.code, "Could not cancel payment intent"),
        }
    }
}

// =============================================================================
// Payment Attempt
// =============================================================================

/// Event sequence of one payment attempt.
///
/// Ends after its terminal status, or silently once a cancel request has
/// been honoured.
pub struct PaymentAttempt {
    payment_data: Option<PaymentData>,
    events: ReceiverStream<CardPaymentStatus>,
}

impl PaymentAttempt {
    /// An attempt that ended before any vendor call.
    pub(crate) fn finished(status: CardPaymentStatus) -> Self {
        let payment_data = status.failure().and_then(|f| f.payment_data);
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(status);
        Self {
            payment_data,
            events: ReceiverStream::new(rx),
        }
    }

    /// Handle for cancelling this attempt while it runs.
    pub fn payment_data(&self) -> Option<PaymentData> {
        self.payment_data
    }
}

impl Stream for PaymentAttempt {
    type Item = CardPaymentStatus;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

// =============================================================================
// Payment Manager
// =============================================================================

/// Drives payment attempts against the connected reader.
pub struct PaymentManager {
    steps: PaymentSteps,
    connection: watch::Receiver<ConnectionStatus>,
    settings: PaymentSettings,
}

impl PaymentManager {
    pub fn new(
        terminal: TerminalWrapper,
        capturer: Arc<dyn PaymentCapturer>,
        connection: watch::Receiver<ConnectionStatus>,
        settings: PaymentSettings,
    ) -> Self {
        let steps = PaymentSteps {
            create: CreatePaymentAction::new(terminal.clone()),
            collect: CollectPaymentAction::new(terminal.clone()),
            process: ProcessPaymentAction::new(terminal.clone()),
            cancel: CancelPaymentAction::new(terminal),
            capturer,
            capture_timeout: Duration::from_secs(settings.capture_timeout_secs),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        };
        Self {
            steps,
            connection,
            settings,
        }
    }

    /// Starts a new payment attempt.
    ///
    /// `permit` is held until the attempt completes, fails or is cancelled.
    pub async fn collect_payment(
        &self,
        info: PaymentInfo,
        permit: Option<OperationGuard>,
    ) -> PaymentAttempt {
        let order_id = info.order_id;
        info!(order_id, amount = %info.amount, currency = %info.currency, "Collecting payment");

        let minimum = self.settings.minimum_charge(&info.currency);
        if let Err(e) = validate_payment_info(&info, minimum) {
            warn!(order_id, error = %e, "Payment input rejected");
            let error_type = if e.is_amount_too_small() {
                CardPaymentStatusErrorType::DeclinedByBackend(Declined::AmountTooSmall)
            } else {
                CardPaymentStatusErrorType::Generic
            };
            return PaymentAttempt::finished(CardPaymentStatus::InitializingPaymentFailed(
                PaymentFailure::new(error_type, e.to_string()),
            ));
        }
        if !self.is_connected() {
            warn!(order_id, "Payment requested with no reader connected");
            return PaymentAttempt::finished(CardPaymentStatus::InitializingPaymentFailed(
                not_connected(),
            ));
        }

        let mut sessions = self.steps.sessions.lock().await;
        if sessions.values().any(|s| s.running) {
            warn!(order_id, "Payment requested while another attempt is running");
            return PaymentAttempt::finished(CardPaymentStatus::InitializingPaymentFailed(
                reader_busy(),
            ));
        }

        // A new attempt supersedes failed ones; their handles go stale.
        let stale = sessions.len();
        sessions.clear();
        if stale > 0 {
            debug!(stale, "Discarded failed payment attempts");
        }

        let payment_data = PaymentData::issue(order_id);
        self.start_run(
            &mut sessions,
            payment_data,
            info,
            None,
            ResumePoint::Create,
            permit,
        )
    }

    /// Resumes a failed attempt at the step it failed in.
    pub async fn retry_collect_payment(
        &self,
        order_id: i64,
        payment_data: PaymentData,
        permit: Option<OperationGuard>,
    ) -> PaymentAttempt {
        let handle = payment_data.handle();
        let mut sessions = self.steps.sessions.lock().await;

        let (running, session_order, resume) = match sessions.get(&handle) {
            Some(s) => (
                s.running,
                s.payment_data.order_id(),
                ResumePoint::for_intent(s.intent.as_ref()),
            ),
            None => {
                info!(order_id, %handle, "Nothing to retry for handle");
                return PaymentAttempt::finished(CardPaymentStatus::NothingToRetry);
            }
        };

        if running {
            warn!(order_id, %handle, "Retry requested for a running attempt");
            return PaymentAttempt::finished(CardPaymentStatus::NothingToRetry);
        }
        if session_order != order_id || payment_data.order_id() != order_id {
            let e = CoreError::HandleOrderMismatch { order_id };
            warn!(error = %e, "Rejected payment retry");
            return PaymentAttempt::finished(CardPaymentStatus::NothingToRetry);
        }
        let start = match resume {
            Some(start) => start,
            None => {
                info!(order_id, "Payment intent already final, nothing to retry");
                sessions.remove(&handle);
                return PaymentAttempt::finished(CardPaymentStatus::NothingToRetry);
            }
        };

        if start != ResumePoint::Capture && !self.is_connected() {
            warn!(order_id, "Payment retry requested with no reader connected");
            return PaymentAttempt::finished(
                start.stage().failed(not_connected().with_payment_data(payment_data)),
            );
        }
        if sessions.values().any(|s| s.running) {
            return PaymentAttempt::finished(
                start.stage().failed(reader_busy().with_payment_data(payment_data)),
            );
        }

        let session = match sessions.remove(&handle) {
            Some(session) => session,
            None => return PaymentAttempt::finished(CardPaymentStatus::NothingToRetry),
        };
        info!(order_id, resume = ?start, "Retrying payment");

        let next = PaymentData::issue(order_id);
        self.start_run(
            &mut sessions,
            next,
            session.info,
            session.intent,
            start,
            permit,
        )
    }

    /// Answers a retry that could not take the operation gate.
    ///
    /// Fails at the stage the retry would resume at and keeps the handle.
    pub async fn reject_busy_retry(
        &self,
        order_id: i64,
        payment_data: PaymentData,
    ) -> PaymentAttempt {
        let sessions = self.steps.sessions.lock().await;
        let start = sessions
            .get(&payment_data.handle())
            .filter(|s| !s.running && s.payment_data.order_id() == order_id)
            .and_then(|s| ResumePoint::for_intent(s.intent.as_ref()));

        match start {
            Some(start) => PaymentAttempt::finished(
                start.stage().failed(reader_busy().with_payment_data(payment_data)),
            ),
            None => PaymentAttempt::finished(CardPaymentStatus::NothingToRetry),
        }
    }

    /// Cancels an attempt.
    ///
    /// A running attempt that has not reached processing ends without further
    /// emissions and its vendor intent is cancelled. A failed attempt is
    /// discarded the same way. Unknown handles are ignored.
    pub async fn cancel_payment(&self, payment_data: PaymentData) {
        let handle = payment_data.handle();
        let task = {
            let mut sessions = self.steps.sessions.lock().await;
            let session = match sessions.get_mut(&handle) {
                Some(session) => session,
                None => {
                    debug!(%handle, "Cancel requested for unknown payment handle");
                    return;
                }
            };

            if session.running {
                if session.stage >= PaymentStage::Processing {
                    info!(
                        order_id = payment_data.order_id(),
                        "Cancel requested after processing started, attempt continues"
                    );
                    return;
                }
                info!(order_id = payment_data.order_id(), "Cancelling payment attempt");
                session.cancel.cancel();
                session.task.take()
            } else {
                None
            }
        };

        if let Some(task) = task {
            let _ = task.await;
        }
        self.discard_idle(handle).await;
    }

    /// Returns true if an attempt is currently running.
    pub async fn has_running_attempt(&self) -> bool {
        self.steps.sessions.lock().await.values().any(|s| s.running)
    }

    fn is_connected(&self) -> bool {
        self.connection.borrow().is_connected()
    }

    async fn discard_idle(&self, handle: Uuid) {
        let intent = {
            let mut sessions = self.steps.sessions.lock().await;
            match sessions.get(&handle) {
                Some(s) if !s.running => sessions.remove(&handle).and_then(|s| s.intent),
                _ => return,
            }
        };
        info!(%handle, "Discarded failed payment attempt");
        if let Some(intent) = intent {
            self.steps.cancel_intent(intent).await;
        }
    }

    fn start_run(
        &self,
        sessions: &mut HashMap<Uuid, PaymentSession>,
        payment_data: PaymentData,
        info: PaymentInfo,
        intent: Option<PaymentIntent>,
        start: ResumePoint,
        permit: Option<OperationGuard>,
    ) -> PaymentAttempt {
        let (tx, rx) = mpsc::channel(PAYMENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        // A consumer that stops listening cancels the attempt.
        tokio::spawn({
            let tx = tx.clone();
            let cancel = cancel.clone();
            let done = done.clone();
            async move {
                tokio::select! {
                    _ = tx.closed() => cancel.cancel(),
                    _ = done.cancelled() => {}
                }
            }
        });

        let run = PaymentRun {
            steps: self.steps.clone(),
            payment_data,
            info: info.clone(),
            intent: intent.clone(),
            cancel: cancel.clone(),
            permit,
            tx,
        };
        let task = tokio::spawn(async move {
            let _done = done.drop_guard();
            run.execute(start).await;
        });

        sessions.insert(
            payment_data.handle(),
            PaymentSession {
                payment_data,
                info,
                intent,
                stage: start.stage(),
                cancel,
                running: true,
                task: Some(task),
            },
        );

        PaymentAttempt {
            payment_data: Some(payment_data),
            events: ReceiverStream::new(rx),
        }
    }
}

fn not_connected() -> PaymentFailure {
    PaymentFailure::new(
        CardPaymentStatusErrorType::ReaderNotConnected,
        "reader not connected",
    )
}

pub(crate) fn reader_busy() -> PaymentFailure {
    PaymentFailure::new(
        CardPaymentStatusErrorType::ReaderBusy,
        "another reader operation is in progress",
    )
}

// =============================================================================
// Payment Run
// =============================================================================

/// One execution of the step sequence, from a resume point to the end.
struct PaymentRun {
    steps: PaymentSteps,
    payment_data: PaymentData,
    info: PaymentInfo,
    intent: Option<PaymentIntent>,
    cancel: CancellationToken,
    permit: Option<OperationGuard>,
    tx: mpsc::Sender<CardPaymentStatus>,
}

impl PaymentRun {
    async fn execute(mut self, start: ResumePoint) {
        if start == ResumePoint::Create && !self.create().await {
            return;
        }
        if start <= ResumePoint::Collect && !self.collect().await {
            return;
        }
        if !self.enter_processing().await {
            return;
        }
        if start <= ResumePoint::Process && !self.process().await {
            return;
        }
        self.capture().await;
    }

    async fn create(&mut self) -> bool {
        self.sync_session(PaymentStage::Initializing).await;
        self.emit(CardPaymentStatus::InitializingPayment).await;

        let params = PaymentIntentParams::from(&self.info);
        match self.steps.create.run(&params).await {
            Ok(intent) if intent.status != PaymentIntentStatus::RequiresPaymentMethod => {
                self.fail_unexpected(PaymentStage::Initializing, intent).await;
                false
            }
            Ok(intent) => {
                debug!(intent_id = %intent.id, "Payment intent created");
                self.intent = Some(intent);
                self.sync_session(PaymentStage::Initializing).await;
                if self.cancel.is_cancelled() {
                    self.finish_cancelled().await;
                    return false;
                }
                true
            }
            Err(e) => {
                let reported = e.payment_intent.clone();
                self.fail(PaymentStage::Initializing, map_terminal_error(&e), reported)
                    .await;
                false
            }
        }
    }

    async fn collect(&mut self) -> bool {
        let intent = match self.intent.clone() {
            Some(intent) => intent,
            None => {
                self.missing_intent(PaymentStage::Collecting).await;
                return false;
            }
        };
        self.sync_session(PaymentStage::Collecting).await;
        self.emit(CardPaymentStatus::CollectingPayment).await;

        let result = self
            .steps
            .collect
            .run(intent.clone(), self.cancel.clone(), &self.tx)
            .await;
        match result {
            Ok(collected) if collected.status != PaymentIntentStatus::RequiresConfirmation => {
                self.fail_unexpected(PaymentStage::Collecting, collected).await;
                false
            }
            Ok(collected) => {
                self.intent = Some(collected);
                true
            }
            Err(e) if e.is_cancellation() && self.cancel.is_cancelled() => {
                self.finish_cancelled().await;
                false
            }
            Err(e) => {
                let reported = e.payment_intent.clone().unwrap_or(intent);
                self.fail(PaymentStage::Collecting, map_terminal_error(&e), Some(reported))
                    .await;
                false
            }
        }
    }

    /// Last point at which a cancel request is honoured.
    async fn enter_processing(&mut self) -> bool {
        let mut sessions = self.steps.sessions.lock().await;
        if self.cancel.is_cancelled() {
            drop(sessions);
            self.finish_cancelled().await;
            return false;
        }
        if let Some(session) = sessions.get_mut(&self.payment_data.handle()) {
            session.stage = PaymentStage::Processing;
            session.intent = self.intent.clone();
        }
        true
    }

    async fn process(&mut self) -> bool {
        let intent = match self.intent.clone() {
            Some(intent) => intent,
            None => {
                self.missing_intent(PaymentStage::Processing).await;
                return false;
            }
        };
        self.emit(CardPaymentStatus::ProcessingPayment).await;

        match self.steps.process.run(intent.clone()).await {
            Ok(processed) if processed.status != PaymentIntentStatus::RequiresCapture => {
                self.fail_unexpected(PaymentStage::Processing, processed).await;
                false
            }
            Ok(processed) => {
                self.intent = Some(processed);
                true
            }
            Err(e) => {
                let reported = e.payment_intent.clone().unwrap_or(intent);
                self.fail(PaymentStage::Processing, map_terminal_error(&e), Some(reported))
                    .await;
                false
            }
        }
    }

    async fn capture(&mut self) {
        let intent = match self.intent.clone() {
            Some(intent) => intent,
            None => {
                self.missing_intent(PaymentStage::Capturing).await;
                return;
            }
        };
        self.sync_session(PaymentStage::Capturing).await;
        self.emit(CardPaymentStatus::CapturingPayment).await;

        let order_id = self.payment_data.order_id();
        let capture = self
            .steps
            .capturer
            .capture_payment_intent(order_id, &intent.id);
        let outcome = match timeout(self.steps.capture_timeout, capture).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(order_id, intent_id = %intent.id, "Capture timed out");
                CaptureOutcome::NetworkError
            }
        };
        info!(order_id, intent_id = %intent.id, outcome = %outcome, "Capture finished");

        if outcome.is_success() {
            self.complete(intent.id).await;
        } else if outcome.is_retryable() {
            self.fail(PaymentStage::Capturing, map_capture_outcome(outcome), Some(intent))
                .await;
        } else {
            self.fail_final(PaymentStage::Capturing, map_capture_outcome(outcome))
                .await;
        }
    }

    // =========================================================================
    // Endings
    // =========================================================================

    /// Parks the attempt as retryable and emits the failure with its handle.
    async fn fail(
        &mut self,
        stage: PaymentStage,
        failure: PaymentFailure,
        intent: Option<PaymentIntent>,
    ) {
        {
            let mut sessions = self.steps.sessions.lock().await;
            if let Some(session) = sessions.get_mut(&self.payment_data.handle()) {
                session.running = false;
                session.task = None;
                session.stage = stage;
                session.intent = intent;
            }
        }
        self.permit.take();

        warn!(
            order_id = self.payment_data.order_id(),
            stage = ?stage,
            reason = %failure.reason,
            "Payment step failed"
        );
        let failure = failure.with_payment_data(self.payment_data);
        self.emit(stage.failed(failure)).await;
    }

    async fn fail_unexpected(&mut self, stage: PaymentStage, intent: PaymentIntent) {
        let failure = PaymentFailure::new(
            CardPaymentStatusErrorType::Generic,
            format!("unexpected payment intent status {}", intent.status),
        );
        self.fail(stage, failure, Some(intent)).await;
    }

    async fn missing_intent(&mut self, stage: PaymentStage) {
        let failure = PaymentFailure::new(
            CardPaymentStatusErrorType::Generic,
            "no payment intent for this attempt",
        );
        self.fail_final(stage, failure).await;
    }

    /// Ends the attempt with a failure that cannot be retried.
    async fn fail_final(&mut self, stage: PaymentStage, failure: PaymentFailure) {
        self.remove_session().await;
        self.permit.take();
        warn!(
            order_id = self.payment_data.order_id(),
            stage = ?stage,
            reason = %failure.reason,
            "Payment attempt failed permanently"
        );
        self.emit(stage.failed(failure)).await;
    }

    async fn complete(&mut self, payment_intent_id: String) {
        self.remove_session().await;
        self.permit.take();
        info!(
            order_id = self.payment_data.order_id(),
            intent_id = %payment_intent_id,
            "Payment completed"
        );
        self.emit(CardPaymentStatus::PaymentCompleted { payment_intent_id })
            .await;
    }

    /// Ends the attempt silently after a cancel request.
    async fn finish_cancelled(&mut self) {
        self.remove_session().await;
        if let Some(intent) = self.intent.take() {
            self.steps.cancel_intent(intent).await;
        }
        self.permit.take();
        info!(order_id = self.payment_data.order_id(), "Payment attempt cancelled");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn sync_session(&self, stage: PaymentStage) {
        let mut sessions = self.steps.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&self.payment_data.handle()) {
            session.stage = stage;
            session.intent = self.intent.clone();
        }
    }

    async fn remove_session(&self) {
        self.steps
            .sessions
            .lock()
            .await
            .remove(&self.payment_data.handle());
    }

    async fn emit(&self, status: CardPaymentStatus) {
        debug!(order_id = self.payment_data.order_id(), ?status, "Payment status");
        // A dropped consumer is handled by the watcher.
        let _ = self.tx.send(status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::terminal::{
        SimulatedBackend, SimulatedTerminal, SimulatedTerminalBuilder, TerminalCall,
        TransportTimeouts,
    };
    use cardreader_core::{Money, Reader, ReaderType, TerminalError};
    use chrono::Utc;
    use futures_util::StreamExt;

    struct Harness {
        manager: PaymentManager,
        terminal: Arc<SimulatedTerminal>,
        backend: Arc<SimulatedBackend>,
        connection: ConnectionManager,
    }

    async fn harness(builder: SimulatedTerminalBuilder, connect: bool) -> Harness {
        harness_with_timeouts(builder, connect, TransportTimeouts::default()).await
    }

    async fn harness_with_timeouts(
        builder: SimulatedTerminalBuilder,
        connect: bool,
        timeouts: TransportTimeouts,
    ) -> Harness {
        let terminal = Arc::new(builder.build());
        let wrapper = TerminalWrapper::new(terminal.clone(), timeouts);
        let connection = ConnectionManager::new(wrapper.clone());
        if connect {
            let reader = Reader::new(Some("SIM-1".into()), ReaderType::WisePade3, Utc::now());
            connection
                .start_connection_to_reader(reader, "tml_1")
                .await
                .unwrap();
        }
        let backend = Arc::new(SimulatedBackend::new());
        let manager = PaymentManager::new(
            wrapper,
            backend.clone(),
            connection.subscribe_status(),
            PaymentSettings::default(),
        );
        Harness {
            manager,
            terminal,
            backend,
            connection,
        }
    }

    fn info(amount: i64) -> PaymentInfo {
        PaymentInfo {
            payment_description: "Order #42".into(),
            order_id: 42,
            amount: Money::from_minor_units(amount),
            currency: "USD".into(),
            customer_email: None,
            customer_name: None,
            store_name: Some("Corner Shop".into()),
            site_url: None,
            order_key: None,
            statement_descriptor: None,
            country_code: Some("US".into()),
            fee_amount: None,
            plugin_can_send_receipt: true,
        }
    }

    fn last_failure(events: &[CardPaymentStatus]) -> PaymentFailure {
        events
            .last()
            .and_then(|s| s.failure())
            .cloned()
            .expect("sequence should end in a failure")
    }

    #[tokio::test]
    async fn test_happy_path_sequence() {
        let h = harness(SimulatedTerminal::builder(), true).await;

        let events: Vec<_> = h.manager.collect_payment(info(1250), None).await.collect().await;

        assert_eq!(
            events,
            vec![
                CardPaymentStatus::InitializingPayment,
                CardPaymentStatus::CollectingPayment,
                CardPaymentStatus::WaitingForInput(vec![
                    cardreader_core::ReaderInputOption::Insert,
                    cardreader_core::ReaderInputOption::Swipe,
                    cardreader_core::ReaderInputOption::Tap,
                ]),
                CardPaymentStatus::ProcessingPayment,
                CardPaymentStatus::CapturingPayment,
                CardPaymentStatus::PaymentCompleted {
                    payment_intent_id: "pi_sim_1".into()
                },
            ]
        );
        assert_eq!(h.backend.captures().await, vec![(42, "pi_sim_1".to_string())]);
        assert!(!h.manager.has_running_attempt().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_reader_fails_collect_instead_of_hanging() {
        let timeouts = TransportTimeouts {
            collect: Duration::from_secs(5),
            ..TransportTimeouts::default()
        };
        let h = harness_with_timeouts(
            SimulatedTerminal::builder().collect_waits_for_cancel(),
            true,
            timeouts,
        )
        .await;

        let events: Vec<_> = h.manager.collect_payment(info(1250), None).await.collect().await;
        assert!(matches!(
            events.last(),
            Some(CardPaymentStatus::CollectingPaymentFailed(_))
        ));
        let failure = last_failure(&events);
        assert_eq!(failure.error_type, CardPaymentStatusErrorType::Generic);
        let data = failure.payment_data.unwrap();

        let retried: Vec<_> = h
            .manager
            .retry_collect_payment(42, data, None)
            .await
            .collect()
            .await;
        assert_eq!(retried.first(), Some(&CardPaymentStatus::CollectingPayment));
        assert!(matches!(
            retried.last(),
            Some(CardPaymentStatus::CollectingPaymentFailed(_))
        ));
        assert_eq!(h.terminal.call_count(TerminalCall::CreatePaymentIntent).await, 1);
        assert_eq!(h.terminal.call_count(TerminalCall::CollectPaymentMethod).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_during_collect_fails_with_handle() {
        let h = harness(SimulatedTerminal::builder().collect_waits_for_cancel(), true).await;

        let mut attempt = h.manager.collect_payment(info(1250), None).await;
        while let Some(status) = attempt.next().await {
            if matches!(status, CardPaymentStatus::WaitingForInput(_)) {
                break;
            }
        }
        h.terminal.simulate_link_loss().await;
        h.connection.handle_unexpected_disconnect();

        let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(1), attempt.collect())
            .await
            .expect("payment hung after the reader link dropped");
        let failure = match rest.last() {
            Some(CardPaymentStatus::CollectingPaymentFailed(failure)) => failure.clone(),
            other => panic!("unexpected final status {:?}", other),
        };
        assert_eq!(failure.error_type, CardPaymentStatusErrorType::ReaderNotConnected);
        let data = failure.payment_data.unwrap();

        // Still disconnected: the handle survives the rejected retry.
        let rejected: Vec<_> = h
            .manager
            .retry_collect_payment(42, data, None)
            .await
            .collect()
            .await;
        assert_eq!(last_failure(&rejected).payment_data, Some(data));

        let reader = Reader::new(Some("SIM-1".into()), ReaderType::WisePade3, Utc::now());
        h.connection
            .start_connection_to_reader(reader, "tml_1")
            .await
            .unwrap();
        let mut resumed = h.manager.retry_collect_payment(42, data, None).await;
        assert_eq!(resumed.next().await, Some(CardPaymentStatus::CollectingPayment));
        assert_eq!(h.terminal.call_count(TerminalCall::CreatePaymentIntent).await, 1);
    }

    #[tokio::test]
    async fn test_decline_then_retry_resumes_at_collect() {
        let h = harness(
            SimulatedTerminal::builder().collect_error(TerminalError::declined("insufficient_funds")),
            true,
        )
        .await;

        let events: Vec<_> = h.manager.collect_payment(info(1250), None).await.collect().await;
        assert!(matches!(
            events.last(),
            Some(CardPaymentStatus::CollectingPaymentFailed(_))
        ));
        let failure = last_failure(&events);
        assert!(failure.reason.starts_with("declined"));
        let data = failure.payment_data.unwrap();

        let retried: Vec<_> = h
            .manager
            .retry_collect_payment(42, data, None)
            .await
            .collect()
            .await;
        assert_eq!(retried.first(), Some(&CardPaymentStatus::CollectingPayment));
        assert!(matches!(
            retried.last(),
            Some(CardPaymentStatus::PaymentCompleted { .. })
        ));
        assert_eq!(h.terminal.call_count(TerminalCall::CreatePaymentIntent).await, 1);
        assert_eq!(h.terminal.call_count(TerminalCall::CollectPaymentMethod).await, 2);
    }

    #[tokio::test]
    async fn test_cancel_after_initializing_stops_sequence() {
        let h = harness(SimulatedTerminal::builder().collect_waits_for_cancel(), true).await;

        let mut attempt = h.manager.collect_payment(info(1250), None).await;
        let data = attempt.payment_data().unwrap();
        assert_eq!(attempt.next().await, Some(CardPaymentStatus::InitializingPayment));

        h.manager.cancel_payment(data).await;
        let rest: Vec<_> = attempt.collect().await;

        assert!(!rest.iter().any(|s| matches!(
            s,
            CardPaymentStatus::ProcessingPayment | CardPaymentStatus::CapturingPayment
        )));
        assert!(!rest.iter().any(CardPaymentStatus::is_terminal));
        assert_eq!(h.terminal.call_count(TerminalCall::CancelPaymentIntent).await, 1);
        assert_eq!(h.terminal.call_count(TerminalCall::ProcessPayment).await, 0);

        let retried: Vec<_> = h
            .manager
            .retry_collect_payment(42, data, None)
            .await
            .collect()
            .await;
        assert_eq!(retried, vec![CardPaymentStatus::NothingToRetry]);
    }

    #[tokio::test]
    async fn test_cancel_after_processing_started_is_ignored() {
        let h = harness(
            SimulatedTerminal::builder().step_delay(Duration::from_millis(50)),
            true,
        )
        .await;

        let mut attempt = h.manager.collect_payment(info(1250), None).await;
        let data = attempt.payment_data().unwrap();
        while let Some(status) = attempt.next().await {
            if status == CardPaymentStatus::ProcessingPayment {
                break;
            }
        }

        h.manager.cancel_payment(data).await;
        let rest: Vec<_> = attempt.collect().await;
        assert!(matches!(
            rest.last(),
            Some(CardPaymentStatus::PaymentCompleted { .. })
        ));
        assert_eq!(h.terminal.call_count(TerminalCall::CancelPaymentIntent).await, 0);
    }

    #[tokio::test]
    async fn test_capture_network_error_retries_capture_only() {
        let h = harness(SimulatedTerminal::builder(), true).await;
        h.backend.push_capture_outcome(CaptureOutcome::NetworkError).await;

        let events: Vec<_> = h.manager.collect_payment(info(1250), None).await.collect().await;
        let failure = last_failure(&events);
        assert!(matches!(
            events.last(),
            Some(CardPaymentStatus::CapturingPaymentFailed(_))
        ));
        assert_eq!(
            failure.error_type,
            CardPaymentStatusErrorType::Capture(CaptureOutcome::NetworkError)
        );

        let retried: Vec<_> = h
            .manager
            .retry_collect_payment(42, failure.payment_data.unwrap(), None)
            .await
            .collect()
            .await;
        assert_eq!(
            retried,
            vec![
                CardPaymentStatus::CapturingPayment,
                CardPaymentStatus::PaymentCompleted {
                    payment_intent_id: "pi_sim_1".into()
                },
            ]
        );
        assert_eq!(h.terminal.call_count(TerminalCall::CreatePaymentIntent).await, 1);
        assert_eq!(h.terminal.call_count(TerminalCall::CollectPaymentMethod).await, 1);
        assert_eq!(h.terminal.call_count(TerminalCall::ProcessPayment).await, 1);
        assert_eq!(h.backend.captures().await.len(), 2);
    }

    #[tokio::test]
    async fn test_already_captured_completes() {
        let h = harness(SimulatedTerminal::builder(), true).await;
        h.backend
            .push_capture_outcome(CaptureOutcome::PaymentAlreadyCaptured)
            .await;

        let events: Vec<_> = h.manager.collect_payment(info(1250), None).await.collect().await;
        assert!(matches!(
            events.last(),
            Some(CardPaymentStatus::PaymentCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_order_is_final() {
        let h = harness(SimulatedTerminal::builder(), true).await;
        h.backend.push_capture_outcome(CaptureOutcome::MissingOrder).await;

        let events: Vec<_> = h.manager.collect_payment(info(1250), None).await.collect().await;
        let failure = last_failure(&events);
        assert_eq!(
            failure.error_type,
            CardPaymentStatusErrorType::Capture(CaptureOutcome::MissingOrder)
        );
        assert!(failure.payment_data.is_none());
    }

    #[tokio::test]
    async fn test_completed_handle_cannot_be_redeemed() {
        let h = harness(SimulatedTerminal::builder(), true).await;
        h.backend.push_capture_outcome(CaptureOutcome::ServerError).await;

        let events: Vec<_> = h.manager.collect_payment(info(1250), None).await.collect().await;
        let data = last_failure(&events).payment_data.unwrap();

        let retried: Vec<_> = h
            .manager
            .retry_collect_payment(42, data, None)
            .await
            .collect()
            .await;
        assert!(matches!(
            retried.last(),
            Some(CardPaymentStatus::PaymentCompleted { .. })
        ));

        let again: Vec<_> = h
            .manager
            .retry_collect_payment(42, data, None)
            .await
            .collect()
            .await;
        assert_eq!(again, vec![CardPaymentStatus::NothingToRetry]);
        assert_eq!(h.backend.captures().await.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_with_wrong_order_is_rejected() {
        let h = harness(
            SimulatedTerminal::builder().collect_error(TerminalError::declined("expired_card")),
            true,
        )
        .await;
        let events: Vec<_> = h.manager.collect_payment(info(1250), None).await.collect().await;
        let data = last_failure(&events).payment_data.unwrap();

        let retried: Vec<_> = h
            .manager
            .retry_collect_payment(7, data, None)
            .await
            .collect()
            .await;
        assert_eq!(retried, vec![CardPaymentStatus::NothingToRetry]);
    }

    #[tokio::test]
    async fn test_not_connected_fails_immediately() {
        let h = harness(SimulatedTerminal::builder(), false).await;

        let attempt = h.manager.collect_payment(info(1250), None).await;
        assert!(attempt.payment_data().is_none());
        let events: Vec<_> = attempt.collect().await;

        let failure = last_failure(&events);
        assert_eq!(events.len(), 1);
        assert_eq!(failure.error_type, CardPaymentStatusErrorType::ReaderNotConnected);
        assert!(h.terminal.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_amount_below_minimum() {
        let h = harness(SimulatedTerminal::builder(), true).await;

        let events: Vec<_> = h.manager.collect_payment(info(30), None).await.collect().await;
        assert_eq!(
            last_failure(&events).error_type,
            CardPaymentStatusErrorType::DeclinedByBackend(Declined::AmountTooSmall)
        );
        assert_eq!(h.terminal.call_count(TerminalCall::CreatePaymentIntent).await, 0);
    }

    #[tokio::test]
    async fn test_unexpected_intent_status_fails_step() {
        let h = harness(
            SimulatedTerminal::builder().process_status(PaymentIntentStatus::Canceled),
            true,
        )
        .await;

        let events: Vec<_> = h.manager.collect_payment(info(1250), None).await.collect().await;
        assert!(matches!(
            events.last(),
            Some(CardPaymentStatus::ProcessingPaymentFailed(_))
        ));
        let failure = last_failure(&events);
        assert_eq!(failure.error_type, CardPaymentStatusErrorType::Generic);

        let retried: Vec<_> = h
            .manager
            .retry_collect_payment(42, failure.payment_data.unwrap(), None)
            .await
            .collect()
            .await;
        assert_eq!(retried, vec![CardPaymentStatus::NothingToRetry]);
    }

    #[tokio::test]
    async fn test_second_attempt_while_running_is_busy() {
        let h = harness(SimulatedTerminal::builder().collect_waits_for_cancel(), true).await;

        let first = h.manager.collect_payment(info(1250), None).await;
        let second: Vec<_> = h.manager.collect_payment(info(990), None).await.collect().await;
        assert_eq!(
            last_failure(&second).error_type,
            CardPaymentStatusErrorType::ReaderBusy
        );

        h.manager.cancel_payment(first.payment_data().unwrap()).await;
        assert!(!h.manager.has_running_attempt().await);
    }
}
