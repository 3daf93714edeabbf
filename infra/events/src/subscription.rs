use crate::handler::HandlerId;
use std::fmt;

type Cancel = Box<dyn FnOnce() + Send + Sync>;

/// Scoped registration token.
///
/// Dropping the token unregisters its handler, turning ownership-driven
/// lifetimes into deterministic eviction. The token never keeps the hub or
/// registry alive.
///
/// If the handler was a duplicate of an existing registration (same identity),
/// dropping the token removes that existing registration.
#[must_use = "Dropping a Subscription unregisters its handler immediately"]
pub struct Subscription {
    event: &'static str,
    handler: HandlerId,
    cancel: Option<Cancel>,
}

impl Subscription {
    pub(crate) fn new(
        event: &'static str,
        handler: HandlerId,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self { event, handler, cancel: Some(Box::new(cancel)) }
    }

    /// Type name of the subscribed event.
    #[must_use]
    pub const fn event(&self) -> &'static str {
        self.event
    }

    /// Identity of the subscribed handler.
    #[must_use]
    pub const fn handler(&self) -> HandlerId {
        self.handler
    }

    /// Unregisters the handler now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Releases the token without unregistering. The handler then lives as
    /// long as its owner (or the registry) does.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("handler", &self.handler)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
