//! Process-wide hub.
//!
//! The global hub is ordinary [`EventHub`] state parked in a [`OnceLock`]. It
//! can be installed explicitly once, at startup, with custom settings; if
//! nothing is installed the first call to [`hub`] creates a default one. It
//! lives for the rest of the process and is never torn down. Code that can
//! take an `EventHub` by parameter should do so and leave this module to
//! composition roots.

use crate::error::{EventHubError, Result};
use crate::hub::EventHub;
use std::sync::OnceLock;
use tracing::{info, trace};

static GLOBAL_HUB: OnceLock<EventHub> = OnceLock::new();

/// Installs `hub` as the process-wide hub.
///
/// # Errors
/// Returns [`EventHubError::GlobalAlreadyInstalled`] if a hub was already
/// installed or lazily created by [`hub`].
pub fn install(hub: EventHub) -> Result<&'static EventHub> {
    GLOBAL_HUB.set(hub).map_err(|_| EventHubError::GlobalAlreadyInstalled {
        message: "a process-wide hub is already in use".into(),
        context: None,
    })?;
    info!("Process-wide event hub installed");
    Ok(self::hub())
}

/// Returns the process-wide hub, creating a default one on first use.
pub fn hub() -> &'static EventHub {
    GLOBAL_HUB.get_or_init(|| {
        trace!("Initializing default process-wide event hub");
        EventHub::new()
    })
}

/// Whether the process-wide hub exists yet.
#[must_use]
pub fn is_initialized() -> bool {
    GLOBAL_HUB.get().is_some()
}
