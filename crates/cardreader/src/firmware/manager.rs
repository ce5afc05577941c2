//! # Software Update Manager
//!
//! Publishes two observables:
//!
//! - `availability`: result of the passive check run after each connection
//! - `status`: the current (or last) install attempt
//!
//! At most one install runs at a time. Starting an install while one is
//! active joins it: the caller gets a handle that resolves to the same
//! terminal status.
//!
//! Cancelling an install stops progress reports immediately. The status is
//! left at whatever was last published.

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cardreader_core::{
    ReaderSoftwareUpdate, SoftwareUpdateAvailability, SoftwareUpdateErrorType,
    SoftwareUpdateStatus, TerminalError, TerminalErrorCode,
};

use super::actions::{CheckSoftwareUpdatesAction, InstallSoftwareUpdateAction};
use crate::connection::ConnectionManager;
use crate::gate::OperationGuard;
use crate::terminal::TerminalWrapper;

const PROGRESS_CHANNEL_CAPACITY: usize = 16;

/// Message of the `Failed` status published when the reader is busy.
pub const READER_BUSY_MESSAGE: &str = "reader busy";

type InstallOutcome = Shared<BoxFuture<'static, SoftwareUpdateStatus>>;

struct UpdateAttempt {
    cancel: CancellationToken,
    /// Cancelled when the install task ends.
    finished: CancellationToken,
    outcome: InstallOutcome,
}

impl UpdateAttempt {
    fn is_active(&self) -> bool {
        !self.finished.is_cancelled()
    }
}

/// Resolves to the terminal status of one install attempt.
///
/// A cancelled attempt resolves to the status last published before the
/// cancel took effect.
#[derive(Clone)]
pub struct InstallHandle {
    outcome: InstallOutcome,
}

impl InstallHandle {
    fn ready(status: SoftwareUpdateStatus) -> Self {
        Self {
            outcome: future::ready(status).boxed().shared(),
        }
    }

    pub async fn outcome(self) -> SoftwareUpdateStatus {
        self.outcome.await
    }
}

/// Checks for and installs reader firmware.
pub struct SoftwareUpdateManager {
    check: CheckSoftwareUpdatesAction,
    install: InstallSoftwareUpdateAction,
    connection: Arc<ConnectionManager>,
    availability_tx: Arc<watch::Sender<SoftwareUpdateAvailability>>,
    /// Bumped by every check and reset; a check publishes only if it is
    /// still the latest.
    availability_epoch: AtomicU64,
    status_tx: Arc<watch::Sender<SoftwareUpdateStatus>>,
    current: Mutex<Option<UpdateAttempt>>,
}

impl SoftwareUpdateManager {
    pub fn new(terminal: TerminalWrapper, connection: Arc<ConnectionManager>) -> Self {
        let (availability_tx, _) = watch::channel(SoftwareUpdateAvailability::Initializing);
        let (status_tx, _) = watch::channel(SoftwareUpdateStatus::Unknown);

        Self {
            check: CheckSoftwareUpdatesAction::new(terminal.clone()),
            install: InstallSoftwareUpdateAction::new(terminal),
            connection,
            availability_tx: Arc::new(availability_tx),
            availability_epoch: AtomicU64::new(0),
            status_tx: Arc::new(status_tx),
            current: Mutex::new(None),
        }
    }

    pub fn subscribe_availability(&self) -> watch::Receiver<SoftwareUpdateAvailability> {
        self.availability_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SoftwareUpdateStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SoftwareUpdateStatus {
        self.status_tx.borrow().clone()
    }

    // =========================================================================
    // Availability
    // =========================================================================

    /// Runs the passive check and publishes its result.
    ///
    /// The result is returned but not published when the reader went away
    /// or a newer check or reset happened while it ran.
    pub async fn check_availability(&self) -> SoftwareUpdateAvailability {
        let epoch = self.availability_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.availability_tx
            .send_replace(SoftwareUpdateAvailability::Initializing);
        let availability = self.check.availability().await;
        match &availability {
            SoftwareUpdateAvailability::CheckFailed(message) => {
                warn!(message = %message, "Software update check failed")
            }
            other => debug!(availability = ?other, "Software update check finished"),
        }
        let current = self.availability_epoch.load(Ordering::SeqCst) == epoch;
        if !current || !self.connection.status().is_connected() {
            debug!("Discarding stale software update check");
            return availability;
        }
        self.availability_tx.send_replace(availability.clone());
        availability
    }

    /// Forgets the last check result, e.g. after the reader went away.
    pub fn reset_availability(&self) {
        self.availability_epoch.fetch_add(1, Ordering::SeqCst);
        self.availability_tx
            .send_replace(SoftwareUpdateAvailability::Initializing);
    }

    // =========================================================================
    // Install
    // =========================================================================

    /// Returns the active install, if there is one.
    pub async fn join_active(&self) -> Option<InstallHandle> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|attempt| attempt.is_active())
            .map(|attempt| InstallHandle {
                outcome: attempt.outcome.clone(),
            })
    }

    /// Starts an install, or joins the active one.
    ///
    /// `permit` is held until the install reaches a terminal status.
    pub async fn start_async_software_update(
        &self,
        permit: Option<OperationGuard>,
    ) -> InstallHandle {
        let mut current = self.current.lock().await;
        if let Some(attempt) = current.as_ref().filter(|a| a.is_active()) {
            info!("Software update already in progress, joining it");
            return InstallHandle {
                outcome: attempt.outcome.clone(),
            };
        }

        let cancel = CancellationToken::new();
        let run = InstallRun {
            check: self.check.clone(),
            install: self.install.clone(),
            connection: self.connection.clone(),
            availability_tx: self.availability_tx.clone(),
            status_tx: self.status_tx.clone(),
            cancel: cancel.clone(),
        };

        let finished = CancellationToken::new();
        let task = tokio::spawn({
            let finished = finished.clone();
            async move {
                let _finished = finished.drop_guard();
                let _permit = permit;
                run.execute().await
            }
        });
        let outcome = async move {
            task.await.unwrap_or_else(|e| {
                error!(error = %e, "Software update task failed");
                SoftwareUpdateStatus::Failed {
                    error_type: SoftwareUpdateErrorType::Failed,
                    message: e.to_string(),
                }
            })
        }
        .boxed()
        .shared();

        *current = Some(UpdateAttempt {
            cancel,
            finished,
            outcome: outcome.clone(),
        });
        InstallHandle { outcome }
    }

    /// Ends an install request that could not take the reader.
    pub fn reject_busy(&self) -> InstallHandle {
        warn!("Software update requested while the reader is busy");
        let status = SoftwareUpdateStatus::Failed {
            error_type: SoftwareUpdateErrorType::Failed,
            message: READER_BUSY_MESSAGE.to_string(),
        };
        self.status_tx.send_replace(status.clone());
        InstallHandle::ready(status)
    }

    /// Cancels the active install and waits for the reader to acknowledge.
    pub async fn cancel_ongoing_firmware_update(&self) {
        let outcome = {
            let current = self.current.lock().await;
            match current.as_ref().filter(|a| a.is_active()) {
                Some(attempt) => {
                    info!("Cancelling software update");
                    attempt.cancel.cancel();
                    attempt.outcome.clone()
                }
                None => {
                    debug!("No software update to cancel");
                    return;
                }
            }
        };
        let status = outcome.await;
        debug!(status = ?status, "Software update cancel acknowledged");
    }
}

// =============================================================================
// Install Run
// =============================================================================

struct InstallRun {
    check: CheckSoftwareUpdatesAction,
    install: InstallSoftwareUpdateAction,
    connection: Arc<ConnectionManager>,
    availability_tx: Arc<watch::Sender<SoftwareUpdateAvailability>>,
    status_tx: Arc<watch::Sender<SoftwareUpdateStatus>>,
    cancel: CancellationToken,
}

impl InstallRun {
    async fn execute(self) -> SoftwareUpdateStatus {
        self.publish(SoftwareUpdateStatus::Initializing);

        if !self.connection.status().is_connected() {
            return self.publish(SoftwareUpdateStatus::Failed {
                error_type: SoftwareUpdateErrorType::ReaderDisconnected,
                message: "reader not connected".to_string(),
            });
        }

        let update = match self.check.run().await {
            Ok(Some(update)) => update,
            Ok(None) => {
                info!("Reader software is up to date");
                self.availability_tx
                    .send_replace(SoftwareUpdateAvailability::UpToDate);
                return self.publish(SoftwareUpdateStatus::UpToDate);
            }
            Err(e) => {
                warn!(code = %e.code, message = %e.message, "Software update check failed");
                return self.publish(SoftwareUpdateStatus::CheckFailed { message: e.message });
            }
        };
        if self.cancel.is_cancelled() {
            return self.last_published();
        }

        self.install_update(update).await
    }

    async fn install_update(&self, update: ReaderSoftwareUpdate) -> SoftwareUpdateStatus {
        let version = update.version.clone();
        self.publish(SoftwareUpdateStatus::InstallationStarted);
        self.publish(SoftwareUpdateStatus::Installing { progress: 0.0 });

        let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let install = self.install.run(update, progress_tx, self.cancel.clone());
        tokio::pin!(install);

        let mut last = 0.0f32;
        let result = loop {
            tokio::select! {
                biased;
                Some(progress) = progress_rx.recv() => self.report_progress(&mut last, progress),
                result = &mut install => break result,
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.report_progress(&mut last, progress);
        }

        if self.cancel.is_cancelled() {
            info!(version = %version, "Software update cancelled");
            return self.last_published();
        }

        match result {
            Ok(()) => {
                info!(version = %version, "Software update installed");
                self.availability_tx
                    .send_replace(SoftwareUpdateAvailability::UpToDate);
                self.publish(SoftwareUpdateStatus::Success)
            }
            Err(e) => {
                warn!(version = %version, code = %e.code, message = %e.message, "Software update failed");
                let error_type = self.error_type(&e);
                self.publish(SoftwareUpdateStatus::Failed {
                    error_type,
                    message: e.message,
                })
            }
        }
    }

    /// Publishes clamped progress, skipping values that would go backwards
    /// and anything after a cancel request.
    fn report_progress(&self, last: &mut f32, progress: f32) {
        if self.cancel.is_cancelled() {
            return;
        }
        let progress = progress.clamp(0.0, 1.0);
        if progress > *last {
            *last = progress;
            self.publish(SoftwareUpdateStatus::Installing { progress });
        }
    }

    fn error_type(&self, error: &TerminalError) -> SoftwareUpdateErrorType {
        match error.code {
            TerminalErrorCode::UpdateBatteryLow => SoftwareUpdateErrorType::BatteryLow {
                current_battery_level: self.connection.battery_level(),
            },
            TerminalErrorCode::ReaderDisconnected | TerminalErrorCode::NotConnectedToReader => {
                SoftwareUpdateErrorType::ReaderDisconnected
            }
            _ => SoftwareUpdateErrorType::Failed,
        }
    }

    fn publish(&self, status: SoftwareUpdateStatus) -> SoftwareUpdateStatus {
        debug!(status = ?status, "Software update status");
        self.status_tx.send_replace(status.clone());
        status
    }

    fn last_published(&self) -> SoftwareUpdateStatus {
        self.status_tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{SimulatedTerminal, SimulatedTerminalBuilder, TerminalCall, TransportTimeouts};
    use cardreader_core::{Reader, ReaderType, UpdateTimeEstimate};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn pending() -> ReaderSoftwareUpdate {
        ReaderSoftwareUpdate {
            version: "2.01.00.17".into(),
            time_estimate: UpdateTimeEstimate::OneToTwoMinutes,
            has_config_update: false,
            has_firmware_update: true,
            has_key_update: false,
        }
    }

    async fn setup(
        builder: SimulatedTerminalBuilder,
    ) -> (SoftwareUpdateManager, Arc<SimulatedTerminal>) {
        let terminal = Arc::new(builder.build());
        let wrapper = TerminalWrapper::new(terminal.clone(), TransportTimeouts::default());
        let connection = Arc::new(ConnectionManager::new(wrapper.clone()));
        let reader = Reader::new(Some("SIM-1".into()), ReaderType::Chipper2X, Utc::now())
            .with_battery_level(0.2);
        connection
            .start_connection_to_reader(reader, "tml_1")
            .await
            .unwrap();
        (SoftwareUpdateManager::new(wrapper, connection), terminal)
    }

    fn record(mut rx: watch::Receiver<SoftwareUpdateStatus>) -> JoinHandle<Vec<SoftwareUpdateStatus>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().clone();
                let done = status.is_terminal();
                seen.push(status);
                if done {
                    break;
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_availability_check() {
        let (manager, terminal) = setup(SimulatedTerminal::builder().pending_update(pending())).await;
        assert_eq!(
            manager.check_availability().await,
            SoftwareUpdateAvailability::UpdateAvailable(pending())
        );

        terminal.set_pending_update(None).await;
        assert_eq!(
            manager.check_availability().await,
            SoftwareUpdateAvailability::UpToDate
        );
        assert_eq!(
            *manager.subscribe_availability().borrow(),
            SoftwareUpdateAvailability::UpToDate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_finishing_after_disconnect_is_not_published() {
        let (manager, _) = setup(
            SimulatedTerminal::builder()
                .pending_update(pending())
                .check_delay(Duration::from_secs(1)),
        )
        .await;
        let manager = Arc::new(manager);

        let check = tokio::spawn({
            let manager = manager.clone();
            async move { manager.check_availability().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.connection.disconnect_reader().await);
        manager.reset_availability();

        assert_eq!(
            check.await.unwrap(),
            SoftwareUpdateAvailability::UpdateAvailable(pending())
        );
        assert_eq!(
            *manager.subscribe_availability().borrow(),
            SoftwareUpdateAvailability::Initializing
        );
    }

    #[tokio::test]
    async fn test_availability_check_failure() {
        let (manager, _) = setup(SimulatedTerminal::builder().check_error(TerminalError::new(
            TerminalErrorCode::ApiConnectionError,
            "no network",
        )))
        .await;
        assert_eq!(
            manager.check_availability().await,
            SoftwareUpdateAvailability::CheckFailed("no network".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_progress_is_monotonic() {
        let (manager, _) = setup(
            SimulatedTerminal::builder()
                .pending_update(pending())
                .install_progress(vec![0.25, 0.2, 0.5, 1.3, 1.0])
                .install_step_delay(Duration::from_millis(100)),
        )
        .await;
        let recorder = record(manager.subscribe_status());

        let outcome = manager.start_async_software_update(None).await.outcome().await;
        assert_eq!(outcome, SoftwareUpdateStatus::Success);

        let seen = recorder.await.unwrap();
        let progress: Vec<f32> = seen.iter().filter_map(|s| s.progress()).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(progress.contains(&0.5));
        assert_eq!(progress.last(), Some(&1.0));
        assert_eq!(seen.last(), Some(&SoftwareUpdateStatus::Success));
        assert_eq!(
            *manager.subscribe_availability().borrow(),
            SoftwareUpdateAvailability::UpToDate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_joins_active_install() {
        let (manager, terminal) = setup(
            SimulatedTerminal::builder()
                .pending_update(pending())
                .install_progress(vec![0.5, 1.0])
                .install_step_delay(Duration::from_millis(100)),
        )
        .await;

        let first = manager.start_async_software_update(None).await;
        let second = manager.start_async_software_update(None).await;

        assert_eq!(first.outcome().await, SoftwareUpdateStatus::Success);
        assert_eq!(second.outcome().await, SoftwareUpdateStatus::Success);
        assert_eq!(terminal.call_count(TerminalCall::InstallUpdate).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_leaves_last_status() {
        let (manager, _) = setup(
            SimulatedTerminal::builder()
                .pending_update(pending())
                .install_progress(vec![0.25, 0.5, 0.75, 1.0])
                .install_step_delay(Duration::from_millis(100)),
        )
        .await;
        let mut status = manager.subscribe_status();

        let handle = manager.start_async_software_update(None).await;
        status
            .wait_for(|s| s.progress() == Some(0.25))
            .await
            .unwrap();

        manager.cancel_ongoing_firmware_update().await;
        assert_eq!(
            handle.outcome().await,
            SoftwareUpdateStatus::Installing { progress: 0.25 }
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.status(), SoftwareUpdateStatus::Installing { progress: 0.25 });
    }

    #[tokio::test]
    async fn test_battery_low_reports_level() {
        let (manager, _) = setup(
            SimulatedTerminal::builder()
                .pending_update(pending())
                .install_error(TerminalError::new(
                    TerminalErrorCode::UpdateBatteryLow,
                    "battery too low to update",
                )),
        )
        .await;

        let outcome = manager.start_async_software_update(None).await.outcome().await;
        assert_eq!(
            outcome,
            SoftwareUpdateStatus::Failed {
                error_type: SoftwareUpdateErrorType::BatteryLow {
                    current_battery_level: Some(0.2)
                },
                message: "battery too low to update".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_no_pending_update_is_up_to_date() {
        let (manager, terminal) = setup(SimulatedTerminal::builder()).await;

        let outcome = manager.start_async_software_update(None).await.outcome().await;
        assert_eq!(outcome, SoftwareUpdateStatus::UpToDate);
        assert_eq!(terminal.call_count(TerminalCall::InstallUpdate).await, 0);
    }

    #[tokio::test]
    async fn test_failed_check_ends_install() {
        let (manager, _) = setup(SimulatedTerminal::builder().check_error(TerminalError::new(
            TerminalErrorCode::ApiError,
            "update service unavailable",
        )))
        .await;

        let outcome = manager.start_async_software_update(None).await.outcome().await;
        assert_eq!(
            outcome,
            SoftwareUpdateStatus::CheckFailed {
                message: "update service unavailable".into()
            }
        );
    }

    #[tokio::test]
    async fn test_reject_busy() {
        let (manager, _) = setup(SimulatedTerminal::builder()).await;
        let outcome = manager.reject_busy().outcome().await;
        assert!(matches!(
            outcome,
            SoftwareUpdateStatus::Failed { ref message, .. } if message == READER_BUSY_MESSAGE
        ));
    }
}
