//! Firmware actions over the terminal wrapper.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cardreader_core::{ReaderSoftwareUpdate, SoftwareUpdateAvailability};

use crate::terminal::{TerminalResult, TerminalWrapper};

/// Asks the reader whether an update is pending.
#[derive(Clone)]
pub struct CheckSoftwareUpdatesAction {
    terminal: TerminalWrapper,
}

impl CheckSoftwareUpdatesAction {
    pub fn new(terminal: TerminalWrapper) -> Self {
        Self { terminal }
    }

    pub async fn run(&self) -> TerminalResult<Option<ReaderSoftwareUpdate>> {
        debug!("Checking for reader software update");
        self.terminal.check_for_update().await
    }

    /// Runs the check and folds the result into an availability value.
    pub async fn availability(&self) -> SoftwareUpdateAvailability {
        match self.run().await {
            Ok(None) => SoftwareUpdateAvailability::UpToDate,
            Ok(Some(update)) => {
                info!(version = %update.version, "Reader software update available");
                SoftwareUpdateAvailability::UpdateAvailable(update)
            }
            Err(e) => SoftwareUpdateAvailability::CheckFailed(e.message),
        }
    }
}

/// Installs a pending update, reporting raw progress to `progress`.
#[derive(Clone)]
pub struct InstallSoftwareUpdateAction {
    terminal: TerminalWrapper,
}

impl InstallSoftwareUpdateAction {
    pub fn new(terminal: TerminalWrapper) -> Self {
        Self { terminal }
    }

    pub async fn run(
        &self,
        update: ReaderSoftwareUpdate,
        progress: mpsc::Sender<f32>,
        cancel: CancellationToken,
    ) -> TerminalResult<()> {
        info!(version = %update.version, "Installing reader software update");
        self.terminal.install_update(update, progress, cancel).await
    }
}
