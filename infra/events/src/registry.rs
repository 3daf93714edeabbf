use crate::config::{HubConfig, MatchPolicy};
use crate::error::EventHubError;
use crate::handler::{Event, Handler, HandlerId, Invocation};
use crate::subscription::Subscription;
use parking_lot::Mutex;
use std::any::{Any, type_name};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

/// Diagnostic hook receiving every absorbed handler failure.
pub type FailureHook = Arc<dyn Fn(&HandlerFailure) + Send + Sync>;

/// A handler failure swallowed during a raise.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Type name of the raised event.
    pub event: &'static str,
    /// Identity of the failed handler.
    pub handler: HandlerId,
    /// What went wrong: a panic in the handler or a failed marshal.
    pub error: EventHubError,
}

/// Outcome counters of a single raise. Purely informational.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaiseReport {
    /// Handlers that ran to completion.
    pub delivered: usize,
    /// Handlers that were dead at their liveness check or lost their owner
    /// right before the call.
    pub skipped: usize,
    /// Handlers whose failure was absorbed.
    pub failed: usize,
    /// Records removed by the post-raise prune.
    pub pruned: usize,
}

#[derive(Clone)]
pub(crate) struct Settings {
    pub(crate) policy: MatchPolicy,
    pub(crate) log_failures: bool,
    pub(crate) hook: Option<FailureHook>,
}

impl Settings {
    pub(crate) fn new(config: &HubConfig, hook: Option<FailureHook>) -> Self {
        Self { policy: config.match_policy, log_failures: config.log_failures, hook }
    }

    fn report(&self, failure: &HandlerFailure) {
        if self.log_failures {
            warn!(
                event = failure.event,
                handler = %failure.handler,
                error = %failure.error,
                "Event handler failed; failure absorbed"
            );
        }
        if let Some(hook) = &self.hook
            && catch_unwind(AssertUnwindSafe(|| hook(failure))).is_err()
        {
            warn!(event = failure.event, "Failure hook panicked");
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(&HubConfig::default(), None)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("policy", &self.policy)
            .field("log_failures", &self.log_failures)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// Ordered, weakly referencing handler list for a single event type.
///
/// Handlers fire in registration order. Dead handlers (owner dropped) are
/// never invoked and are pruned on the next `register`, `unregister`, or on
/// the raise that noticed them. Pruning only filters; survivors keep their
/// relative order.
///
/// Handlers are invoked on a snapshot taken at the start of a raise and with
/// no lock held, so a handler may freely register, unregister or raise on the
/// same registry. A handler registered during a raise first fires on the next
/// one; a handler unregistered during a raise does not fire again, not even
/// later in the same sweep.
pub struct WeakHandlerRegistry<E: Event> {
    records: Mutex<Vec<Record<E>>>,
    settings: Settings,
}

struct Record<E: Event> {
    handler: Handler<E>,
    removed: Arc<AtomicBool>,
}

impl<E: Event> Record<E> {
    fn new(handler: Handler<E>) -> Self {
        Self { handler, removed: Arc::new(AtomicBool::new(false)) }
    }

    fn retire(&self) {
        self.removed.store(true, Ordering::Release);
    }

    fn is_retired(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

impl<E: Event> Clone for Record<E> {
    fn clone(&self) -> Self {
        Self { handler: self.handler.clone(), removed: Arc::clone(&self.removed) }
    }
}

impl<E: Event> WeakHandlerRegistry<E> {
    /// Creates an empty registry with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    /// Creates an empty registry using `config`.
    #[must_use]
    pub fn with_config(config: &HubConfig) -> Self {
        Self::with_settings(Settings::new(config, None))
    }

    pub(crate) const fn with_settings(settings: Settings) -> Self {
        Self { records: Mutex::new(Vec::new()), settings }
    }

    /// Appends `handler` unless an alive record with the same identity exists.
    pub fn register(&self, handler: Handler<E>) {
        let id = handler.id();
        let mut records = self.records.lock();
        prune_dead(&mut records);

        if records
            .iter()
            .any(|r| r.handler.is_alive() && r.handler.id().matches(&id, self.settings.policy))
        {
            trace!(event = type_name::<E>(), handler = %id, "Handler already registered");
            return;
        }

        records.push(Record::new(handler));
        trace!(event = type_name::<E>(), handler = %id, count = records.len(), "Handler registered");
    }

    /// Removes the first record matching the identity of `handler`, if any.
    ///
    /// Takes effect immediately: a raise already in progress will not call
    /// the removed handler.
    pub fn unregister(&self, handler: &Handler<E>) {
        self.unregister_id(handler.id());
    }

    pub(crate) fn unregister_id(&self, id: HandlerId) {
        let mut records = self.records.lock();
        prune_dead(&mut records);

        match records.iter().position(|r| r.handler.id().matches(&id, self.settings.policy)) {
            Some(index) => {
                records.remove(index).retire();
                trace!(event = type_name::<E>(), handler = %id, "Handler unregistered");
            },
            None => trace!(event = type_name::<E>(), handler = %id, "Unregister target not found"),
        }
    }

    /// Registers `handler` and returns a guard that unregisters it on drop.
    ///
    /// The guard references the registry weakly; dropping it after the
    /// registry itself is gone is a no-op.
    pub fn subscribe(self: &Arc<Self>, handler: Handler<E>) -> Subscription {
        let id = handler.id();
        self.register(handler);
        let registry = Arc::downgrade(self);
        Subscription::new(type_name::<E>(), id, move || {
            if let Some(registry) = registry.upgrade() {
                registry.unregister_id(id);
            }
        })
    }

    /// Removes every record.
    pub fn clear(&self) {
        let removed = {
            let mut records = self.records.lock();
            let removed = records.len();
            records.drain(..).for_each(|record| record.retire());
            removed
        };
        trace!(event = type_name::<E>(), removed, "Handler registry cleared");
    }

    /// Invokes every live handler with `event`, in registration order.
    pub fn raise(&self, event: E) -> RaiseReport {
        self.raise_arc(Arc::new(event))
    }

    /// Same as [`raise`](Self::raise) for an already shared event.
    pub fn raise_arc(&self, event: Arc<E>) -> RaiseReport {
        let snapshot = self.records.lock().clone();
        let mut report = RaiseReport::default();
        let mut prune_needed = false;

        for record in &snapshot {
            if record.is_retired() {
                continue;
            }
            let handler = &record.handler;
            if !handler.is_alive() {
                prune_needed = true;
                report.skipped += 1;
                continue;
            }

            match handler.invoke(&event) {
                Invocation::Completed => report.delivered += 1,
                Invocation::Skipped => {
                    prune_needed = true;
                    report.skipped += 1;
                },
                Invocation::Failed(error) => {
                    report.failed += 1;
                    self.settings.report(&HandlerFailure {
                        event: type_name::<E>(),
                        handler: handler.id(),
                        error,
                    });
                },
            }
        }
        drop(snapshot);

        if prune_needed {
            report.pruned = self.prune();
            debug!(
                event = type_name::<E>(),
                delivered = report.delivered,
                pruned = report.pruned,
                "Event raised; dead handlers pruned"
            );
        }

        report
    }

    /// Drops every record whose owner is gone. Returns the number removed.
    pub fn prune(&self) -> usize {
        prune_dead(&mut self.records.lock())
    }

    /// Number of records currently held, including dead ones not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// `true` if no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl<E: Event> Default for WeakHandlerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for WeakHandlerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakHandlerRegistry")
            .field("event", &type_name::<E>())
            .field("len", &self.len())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Type-erased view used by the hub to keep registries of different event
/// types in one map.
pub(crate) trait AnyRegistry: Any + Send + Sync + fmt::Debug {
    fn prune(&self) -> usize;
    fn clear(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: Event> AnyRegistry for WeakHandlerRegistry<E> {
    fn prune(&self) -> usize {
        Self::prune(self)
    }

    fn clear(&self) {
        Self::clear(self);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn prune_dead<E: Event>(records: &mut Vec<Record<E>>) -> usize {
    let before = records.len();
    records.retain(|record| record.handler.is_alive());
    let removed = before - records.len();
    if removed > 0 {
        trace!(event = type_name::<E>(), removed, "Pruned dead handlers");
    }
    removed
}
