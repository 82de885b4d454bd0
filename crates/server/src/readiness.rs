//! First-run readiness gate.
//!
//! The backend needs an API key file before it can do anything useful. Until
//! the user has filled it in, the shell holds back autostart and tells
//! clients that setup is required.

use std::path::Path;

use tracing::{info, warn};

/// Placeholder text the credentials file ships with.
pub const PLACEHOLDER_MARKER: &str = "empty";

/// True when the credentials file is missing, unreadable, or untouched.
pub fn setup_pending(credentials: &Path) -> bool {
    match std::fs::read_to_string(credentials) {
        Ok(contents) if contents.contains(PLACEHOLDER_MARKER) => {
            info!(
                component = "readiness",
                event = "readiness.placeholder",
                path = %credentials.display(),
                "Credentials still hold the placeholder, setup required"
            );
            true
        }
        Ok(_) => false,
        Err(e) => {
            warn!(
                component = "readiness",
                event = "readiness.unreadable",
                path = %credentials.display(),
                error = %e,
                "Credentials file unreadable, setup required"
            );
            true
        }
    }
}
