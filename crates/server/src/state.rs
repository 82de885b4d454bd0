//! Application state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::relay::RelayChannel;
use crate::supervisor::{SupervisorError, SupervisorHandle};

/// Shared application state
pub struct AppState {
    pub relay: Arc<RelayChannel>,
    pub supervisor: SupervisorHandle,

    /// Readiness gate: autostart waits until setup is completed
    setup_pending: AtomicBool,
}

impl AppState {
    pub fn new(relay: Arc<RelayChannel>, supervisor: SupervisorHandle, setup_pending: bool) -> Self {
        Self {
            relay,
            supervisor,
            setup_pending: AtomicBool::new(setup_pending),
        }
    }

    pub fn setup_pending(&self) -> bool {
        self.setup_pending.load(Ordering::SeqCst)
    }

    /// Clear the readiness gate and start the backend.
    ///
    /// A backend that is already active counts as success.
    pub async fn complete_setup(&self) -> Result<(), SupervisorError> {
        let was_pending = self.setup_pending.swap(false, Ordering::SeqCst);
        info!(
            component = "state",
            event = "setup.completed",
            was_pending,
            "Setup completed, starting backend"
        );
        match self.supervisor.start().await {
            Err(SupervisorError::AlreadyActive(_)) => Ok(()),
            other => other,
        }
    }
}
