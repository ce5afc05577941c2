//! # Interac Refunds
//!
//! Card-present refunds of Interac charges: collect the original card, then
//! send the refund to the card network.
//!
//! ```text
//! refund_interac_payment(params)
//!   ├─ invalid params / no reader / busy ──► InteracRefundFailure
//!   ├─ InitializingInteracRefund
//!   ├─ CollectingInteracRefund ──(vendor error / cancel)──► InteracRefundFailure
//!   ├─ ProcessingInteracRefund ──(vendor error)───────────► InteracRefundFailure
//!   └─ InteracRefundSuccess
//! ```
//!
//! A cancel request is honoured while the card is being collected. Once the
//! refund is processing it runs to its end.

use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cardreader_core::error_mapper::map_refund_error;
use cardreader_core::validation::validate_refund_params;
use cardreader_core::{
    CardInteracRefundStatus, ConnectionStatus, RefundFailure, RefundParams, RefundStatus,
    RefundStatusErrorType,
};

use super::actions::{CollectRefundAction, ProcessRefundAction};
use crate::gate::OperationGuard;
use crate::terminal::TerminalWrapper;

const REFUND_CHANNEL_CAPACITY: usize = 16;

/// Event sequence of one refund.
pub struct RefundAttempt {
    events: ReceiverStream<CardInteracRefundStatus>,
}

impl RefundAttempt {
    /// A refund that ended before any vendor call.
    pub(crate) fn finished(status: CardInteracRefundStatus) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(status);
        Self {
            events: ReceiverStream::new(rx),
        }
    }
}

impl Stream for RefundAttempt {
    type Item = CardInteracRefundStatus;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

pub(crate) fn refund_failure(
    params: RefundParams,
    reason: impl Into<String>,
) -> CardInteracRefundStatus {
    CardInteracRefundStatus::InteracRefundFailure(RefundFailure::new(
        RefundStatusErrorType::Generic,
        reason,
        params,
    ))
}

struct ActiveRefund {
    cancel: CancellationToken,
    /// Cancelled when the run task ends.
    done: CancellationToken,
    processing: watch::Receiver<bool>,
}

/// Runs Interac refunds against the connected reader, one at a time.
pub struct RefundManager {
    collect: CollectRefundAction,
    process: ProcessRefundAction,
    connection: watch::Receiver<ConnectionStatus>,
    active: Mutex<Option<ActiveRefund>>,
}

impl RefundManager {
    pub fn new(terminal: TerminalWrapper, connection: watch::Receiver<ConnectionStatus>) -> Self {
        Self {
            collect: CollectRefundAction::new(terminal.clone()),
            process: ProcessRefundAction::new(terminal),
            connection,
            active: Mutex::new(None),
        }
    }

    /// Starts a refund. `permit` is held until the refund ends.
    pub async fn refund_interac_payment(
        &self,
        params: RefundParams,
        permit: Option<OperationGuard>,
    ) -> RefundAttempt {
        if let Err(e) = validate_refund_params(&params) {
            warn!(error = %e, "Rejected refund parameters");
            return RefundAttempt::finished(refund_failure(params, e.to_string()));
        }
        if !self.connection.borrow().is_connected() {
            warn!(charge_id = %params.charge_id, "Refund requested with no reader connected");
            return RefundAttempt::finished(refund_failure(params, "reader not connected"));
        }

        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|a| !a.done.is_cancelled()) {
            warn!(charge_id = %params.charge_id, "Refund requested while another is running");
            return RefundAttempt::finished(refund_failure(params, "reader busy"));
        }

        info!(charge_id = %params.charge_id, amount = %params.amount, "Starting Interac refund");
        let (tx, rx) = mpsc::channel(REFUND_CHANNEL_CAPACITY);
        let (processing_tx, processing) = watch::channel(false);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        // A consumer that stops listening cancels the refund.
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

        let run = RefundRun {
            collect: self.collect.clone(),
            process: self.process.clone(),
            params,
            cancel: cancel.clone(),
            processing: processing_tx,
            tx,
        };
        tokio::spawn({
            let done = done.clone();
            async move {
                let _done = done.drop_guard();
                let _permit = permit;
                run.execute().await;
            }
        });

        *active = Some(ActiveRefund {
            cancel,
            done,
            processing,
        });
        RefundAttempt {
            events: ReceiverStream::new(rx),
        }
    }

    /// Cancels the running refund while its card is being collected.
    ///
    /// Returns true if the cancel request was accepted.
    pub async fn cancel_interac_refund(&self) -> bool {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(a) if !a.done.is_cancelled() && !*a.processing.borrow() => {
                info!("Cancelling Interac refund");
                a.cancel.cancel();
                true
            }
            Some(a) if !a.done.is_cancelled() => {
                info!("Cancel requested after the refund started processing, refund continues");
                false
            }
            _ => {
                debug!("Cancel requested with no refund running");
                false
            }
        }
    }

    pub async fn has_running_refund(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|a| !a.done.is_cancelled())
    }
}

struct RefundRun {
    collect: CollectRefundAction,
    process: ProcessRefundAction,
    params: RefundParams,
    cancel: CancellationToken,
    processing: watch::Sender<bool>,
    tx: mpsc::Sender<CardInteracRefundStatus>,
}

impl RefundRun {
    async fn execute(self) {
        self.emit(CardInteracRefundStatus::InitializingInteracRefund).await;
        self.emit(CardInteracRefundStatus::CollectingInteracRefund).await;

        if let Err(e) = self.collect.run(&self.params, self.cancel.clone()).await {
            self.fail(map_refund_error(&self.params, &e)).await;
            return;
        }

        // Last point at which a cancel request is honoured.
        if self.cancel.is_cancelled() {
            let failure = RefundFailure::new(
                RefundStatusErrorType::Cancelled,
                "refund cancelled",
                self.params.clone(),
            );
            self.fail(failure).await;
            return;
        }
        self.processing.send_replace(true);
        self.emit(CardInteracRefundStatus::ProcessingInteracRefund).await;

        match self.process.run().await {
            Ok(refund) if refund.status == RefundStatus::Failed => {
                let failure = RefundFailure::new(
                    RefundStatusErrorType::Generic,
                    "card network rejected the refund",
                    self.params.clone(),
                );
                self.fail(failure).await;
            }
            Ok(refund) => {
                info!(refund_id = %refund.id, charge_id = %refund.charge_id, "Interac refund finished");
                self.emit(CardInteracRefundStatus::InteracRefundSuccess).await;
            }
            Err(e) => self.fail(map_refund_error(&self.params, &e)).await,
        }
    }

    async fn fail(&self, failure: RefundFailure) {
        warn!(
            charge_id = %self.params.charge_id,
            error_type = ?failure.error_type,
            reason = %failure.reason,
            "Interac refund failed"
        );
        self.emit(CardInteracRefundStatus::InteracRefundFailure(failure))
            .await;
    }

    async fn emit(&self, status: CardInteracRefundStatus) {
        debug!(charge_id = %self.params.charge_id, ?status, "Refund status");
        // A dropped consumer is handled by the watcher.
        let _ = self.tx.send(status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::terminal::{
        SimulatedTerminal, SimulatedTerminalBuilder, TerminalCall, TransportTimeouts,
    };
    use cardreader_core::{
        CardDeclineReason, Declined, Money, Reader, ReaderType, TerminalError, TerminalErrorCode,
    };
    use chrono::Utc;
    use futures_util::StreamExt;
    use std::sync::Arc;

    struct Harness {
        manager: RefundManager,
        terminal: Arc<SimulatedTerminal>,
        _connection: ConnectionManager,
    }

    async fn harness(builder: SimulatedTerminalBuilder, connect: bool) -> Harness {
        let terminal = Arc::new(builder.build());
        let wrapper = TerminalWrapper::new(terminal.clone(), TransportTimeouts::default());
        let connection = ConnectionManager::new(wrapper.clone());
        if connect {
            let reader = Reader::new(Some("SIM-1".into()), ReaderType::WisePade3, Utc::now());
            connection
                .start_connection_to_reader(reader, "tml_1")
                .await
                .unwrap();
        }
        Harness {
            manager: RefundManager::new(wrapper, connection.subscribe_status()),
            terminal,
            _connection: connection,
        }
    }

    fn params() -> RefundParams {
        RefundParams {
            charge_id: "ch_interac_1".into(),
            amount: Money::from_minor_units(1500),
            currency: "CAD".into(),
        }
    }

    fn last_failure(events: &[CardInteracRefundStatus]) -> RefundFailure {
        events
            .last()
            .and_then(|s| s.failure())
            .cloned()
            .expect("sequence should end in a failure")
    }

    #[tokio::test]
    async fn test_refund_sequence() {
        let h = harness(SimulatedTerminal::builder(), true).await;

        let events: Vec<_> = h
            .manager
            .refund_interac_payment(params(), None)
            .await
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                CardInteracRefundStatus::InitializingInteracRefund,
                CardInteracRefundStatus::CollectingInteracRefund,
                CardInteracRefundStatus::ProcessingInteracRefund,
                CardInteracRefundStatus::InteracRefundSuccess,
            ]
        );
        assert_eq!(
            h.terminal.call_count(TerminalCall::CollectRefundPaymentMethod).await,
            1
        );
        assert_eq!(h.terminal.call_count(TerminalCall::ProcessRefund).await, 1);
        assert!(!h.manager.has_running_refund().await);
    }

    #[tokio::test]
    async fn test_declined_refund_keeps_params() {
        let h = harness(
            SimulatedTerminal::builder().refund_collect_error(TerminalError::declined("expired_card")),
            true,
        )
        .await;

        let events: Vec<_> = h
            .manager
            .refund_interac_payment(params(), None)
            .await
            .collect()
            .await;
        let failure = last_failure(&events);

        assert_eq!(
            failure.error_type,
            RefundStatusErrorType::DeclinedByBackend(Declined::CardDeclined(
                CardDeclineReason::ExpiredCard
            ))
        );
        assert_eq!(failure.refund_params, params());
        assert_eq!(h.terminal.call_count(TerminalCall::ProcessRefund).await, 0);
    }

    #[tokio::test]
    async fn test_processing_network_error() {
        let h = harness(
            SimulatedTerminal::builder().refund_process_error(TerminalError::new(
                TerminalErrorCode::ApiConnectionError,
                "offline",
            )),
            true,
        )
        .await;

        let events: Vec<_> = h
            .manager
            .refund_interac_payment(params(), None)
            .await
            .collect()
            .await;
        assert!(events.contains(&CardInteracRefundStatus::ProcessingInteracRefund));
        assert_eq!(last_failure(&events).error_type, RefundStatusErrorType::NoNetwork);
    }

    #[tokio::test]
    async fn test_network_rejection_is_generic() {
        let h = harness(SimulatedTerminal::builder().refund_status(RefundStatus::Failed), true).await;

        let events: Vec<_> = h
            .manager
            .refund_interac_payment(params(), None)
            .await
            .collect()
            .await;
        assert_eq!(last_failure(&events).error_type, RefundStatusErrorType::Generic);
    }

    #[tokio::test]
    async fn test_not_connected_and_invalid_params() {
        let h = harness(SimulatedTerminal::builder(), false).await;
        let events: Vec<_> = h
            .manager
            .refund_interac_payment(params(), None)
            .await
            .collect()
            .await;
        assert_eq!(last_failure(&events).reason, "reader not connected");

        let h = harness(SimulatedTerminal::builder(), true).await;
        let invalid = RefundParams {
            charge_id: String::new(),
            ..params()
        };
        let events: Vec<_> = h
            .manager
            .refund_interac_payment(invalid, None)
            .await
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(last_failure(&events).error_type, RefundStatusErrorType::Generic);
        assert_eq!(h.terminal.call_count(TerminalCall::CollectRefundPaymentMethod).await, 0);
    }

    #[tokio::test]
    async fn test_cancel_while_collecting() {
        let h = harness(SimulatedTerminal::builder().collect_waits_for_cancel(), true).await;

        let mut attempt = h.manager.refund_interac_payment(params(), None).await;
        assert_eq!(
            attempt.next().await,
            Some(CardInteracRefundStatus::InitializingInteracRefund)
        );
        assert!(h.manager.cancel_interac_refund().await);

        let rest: Vec<_> = attempt.collect().await;
        assert_eq!(last_failure(&rest).error_type, RefundStatusErrorType::Cancelled);
        assert!(!rest.contains(&CardInteracRefundStatus::ProcessingInteracRefund));
        assert_eq!(h.terminal.call_count(TerminalCall::ProcessRefund).await, 0);
        assert!(!h.manager.cancel_interac_refund().await);
    }

    #[tokio::test]
    async fn test_second_refund_is_rejected_while_one_runs() {
        let h = harness(SimulatedTerminal::builder().collect_waits_for_cancel(), true).await;

        let _first = h.manager.refund_interac_payment(params(), None).await;
        let second: Vec<_> = h
            .manager
            .refund_interac_payment(params(), None)
            .await
            .collect()
            .await;
        assert_eq!(last_failure(&second).reason, "reader busy");
        assert!(h.manager.has_running_refund().await);

        h.manager.cancel_interac_refund().await;
    }
}
