//! Single-step payment actions over the terminal wrapper.
//!
//! Each action performs one vendor round trip. Sequencing, retry and
//! cancellation policy live in [`super::manager`].

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cardreader_core::{CardPaymentStatus, PaymentIntent, PaymentIntentParams, Refund, RefundParams};

use crate::terminal::{TerminalEvent, TerminalResult, TerminalWrapper};

/// Creates the vendor payment intent.
#[derive(Clone)]
pub struct CreatePaymentAction {
    terminal: TerminalWrapper,
}

impl CreatePaymentAction {
    pub fn new(terminal: TerminalWrapper) -> Self {
        Self { terminal }
    }

    pub async fn run(&self, params: &PaymentIntentParams) -> TerminalResult<PaymentIntent> {
        debug!(amount = %params.amount, currency = %params.currency, "Creating payment intent");
        self.terminal.create_payment_intent(params).await
    }
}

/// Collects a payment method from the reader, relaying reader prompts.
#[derive(Clone)]
pub struct CollectPaymentAction {
    terminal: TerminalWrapper,
}

impl CollectPaymentAction {
    pub fn new(terminal: TerminalWrapper) -> Self {
        Self { terminal }
    }

    /// Waits for a card. Reader prompts raised while waiting are sent to
    /// `prompts` as `WaitingForInput` / `ShowAdditionalInfo`, all of them
    /// before this returns.
    pub async fn run(
        &self,
        intent: PaymentIntent,
        cancel: CancellationToken,
        prompts: &mpsc::Sender<CardPaymentStatus>,
    ) -> TerminalResult<PaymentIntent> {
        let mut events = self.terminal.subscribe();
        let collect = self.terminal.collect_payment_method(intent, cancel);
        tokio::pin!(collect);

        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => relay_prompt(prompts, event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reader prompts dropped while collecting payment");
                    }
                    Err(RecvError::Closed) => return (&mut collect).await,
                },
                result = &mut collect => {
                    while let Ok(event) = events.try_recv() {
                        relay_prompt(prompts, event).await;
                    }
                    return result;
                }
            }
        }
    }
}

async fn relay_prompt(prompts: &mpsc::Sender<CardPaymentStatus>, event: TerminalEvent) {
    let status = match event {
        TerminalEvent::ReaderInputRequested(options) => CardPaymentStatus::WaitingForInput(options),
        TerminalEvent::DisplayMessageRequested(info) => CardPaymentStatus::ShowAdditionalInfo(info),
        _ => return,
    };
    // A dropped consumer is picked up by the manager.
    let _ = prompts.send(status).await;
}

/// Confirms the collected payment with the card network.
#[derive(Clone)]
pub struct ProcessPaymentAction {
    terminal: TerminalWrapper,
}

impl ProcessPaymentAction {
    pub fn new(terminal: TerminalWrapper) -> Self {
        Self { terminal }
    }

    pub async fn run(&self, intent: PaymentIntent) -> TerminalResult<PaymentIntent> {
        debug!(intent_id = %intent.id, "Processing payment");
        self.terminal.process_payment(intent).await
    }
}

/// Cancels a vendor payment intent.
#[derive(Clone)]
pub struct CancelPaymentAction {
    terminal: TerminalWrapper,
}

impl CancelPaymentAction {
    pub fn new(terminal: TerminalWrapper) -> Self {
        Self { terminal }
    }

    pub async fn run(&self, intent: PaymentIntent) -> TerminalResult<PaymentIntent> {
        debug!(intent_id = %intent.id, "Cancelling payment intent");
        self.terminal.cancel_payment_intent(intent).await
    }
}

/// Collects the card of the charge being refunded.
#[derive(Clone)]
pub struct CollectRefundAction {
    terminal: TerminalWrapper,
}

impl CollectRefundAction {
    pub fn new(terminal: TerminalWrapper) -> Self {
        Self { terminal }
    }

    pub async fn run(&self, params: &RefundParams, cancel: CancellationToken) -> TerminalResult<()> {
        debug!(charge_id = %params.charge_id, amount = %params.amount, "Collecting refund card");
        self.terminal
            .collect_refund_payment_method(params, cancel)
            .await
    }
}

/// Sends the collected refund to the card network.
#[derive(Clone)]
pub struct ProcessRefundAction {
    terminal: TerminalWrapper,
}

impl ProcessRefundAction {
    pub fn new(terminal: TerminalWrapper) -> Self {
        Self { terminal }
    }

    pub async fn run(&self) -> TerminalResult<Refund> {
        debug!("Processing refund");
        self.terminal.process_refund().await
    }
}
