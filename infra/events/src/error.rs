use std::any::Any;
use std::borrow::Cow;

/// Errors produced by the event hub.
///
/// None of these ever escape `register`, `unregister`, `raise` or `clear`.
/// Handler failures are absorbed and handed to the diagnostic hook as a
/// [`HandlerFailure`](crate::HandlerFailure); the remaining variants come from
/// setup APIs such as configuration loading and global installation.
#[derive(Debug, thiserror::Error)]
pub enum EventHubError {
    /// A handler body panicked while processing an event.
    #[error("Handler panicked{}: {message}", format_context(.context))]
    HandlerPanicked { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The owner's affinity context could not run the marshaled call.
    #[error("Marshal failed{}: {message}", format_context(.context))]
    MarshalFailed { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// Configuration could not be built or deserialized.
    #[error("Config error{}: {source}", format_context(.context))]
    Config {
        #[source]
        source: config::ConfigError,
        context: Option<Cow<'static, str>>,
    },

    /// The process-wide hub was already initialized.
    #[error("Global hub already installed{}: {message}", format_context(.context))]
    GlobalAlreadyInstalled { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

pub type Result<T, E = EventHubError> = std::result::Result<T, E>;

/// Adds a human-readable context to a failed result.
pub trait EventHubErrorExt<T> {
    /// Attaches `context` to the error, converting it into [`EventHubError`] if needed.
    ///
    /// # Errors
    /// Returns the original error with the context applied.
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T>;
}

impl<T> EventHubErrorExt<T> for Result<T> {
    #[inline]
    fn context(self, context: impl Into<Cow<'static, str>>) -> Self {
        self.map_err(|mut e| {
            match &mut e {
                EventHubError::HandlerPanicked { context: c, .. }
                | EventHubError::MarshalFailed { context: c, .. }
                | EventHubError::Config { context: c, .. }
                | EventHubError::GlobalAlreadyInstalled { context: c, .. } => {
                    *c = Some(context.into());
                },
            }
            e
        })
    }
}

impl<T> EventHubErrorExt<T> for std::result::Result<T, config::ConfigError> {
    #[inline]
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T> {
        self.map_err(|source| EventHubError::Config { source, context: Some(context.into()) })
    }
}

impl From<config::ConfigError> for EventHubError {
    #[inline]
    fn from(source: config::ConfigError) -> Self {
        Self::Config { source, context: None }
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Cow<'static, str> {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        Cow::Borrowed(message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        Cow::Owned(message.clone())
    } else {
        Cow::Borrowed("non-string panic payload")
    }
}

#[allow(clippy::ref_option)]
fn format_context(context: &Option<Cow<'static, str>>) -> Cow<'static, str> {
    context.as_ref().map_or(Cow::Borrowed(""), |c| Cow::Owned(format!(" ({c})")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = EventHubError::HandlerPanicked {
            message: "boom".into(),
            context: Some("CustomerChanged".into()),
        };
        assert_eq!(err.to_string(), "Handler panicked (CustomerChanged): boom");
    }

    #[test]
    fn test_context_overrides_existing() {
        let result: Result<()> =
            Err(EventHubError::MarshalFailed { message: "closed".into(), context: None });
        let err = result.context("dispatch thread").unwrap_err();
        assert_eq!(err.to_string(), "Marshal failed (dispatch thread): closed");
    }

    #[test]
    fn test_panic_message_variants() {
        let borrowed: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(borrowed.as_ref()), "static");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
