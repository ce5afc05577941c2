//! Single-operation gate.
//!
//! Payments, Interac refunds and firmware installs must never drive the
//! same reader at the same time. The façade takes the one permit before
//! starting any of them; the permit is released when the operation reaches
//! a terminal state.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Kind of operation holding the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Payment,
    Refund,
    SoftwareUpdate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Payment => write!(f, "payment"),
            OperationKind::Refund => write!(f, "refund"),
            OperationKind::SoftwareUpdate => write!(f, "software_update"),
        }
    }
}

/// One-permit gate shared by payments and firmware installs.
#[derive(Clone)]
pub struct OperationGate {
    permits: Arc<Semaphore>,
}

impl Default for OperationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationGate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Takes the gate, or returns `None` if another operation holds it.
    pub fn try_acquire(&self, kind: OperationKind) -> Option<OperationGuard> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        debug!(operation = %kind, "Reader operation gate acquired");
        Some(OperationGuard {
            kind,
            _permit: permit,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

/// Held for the lifetime of one gated operation.
pub struct OperationGuard {
    kind: OperationKind,
    _permit: OwnedSemaphorePermit,
}

impl OperationGuard {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGuard").field("kind", &self.kind).finish()
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        debug!(operation = %self.kind, "Reader operation gate released");
    }
}
