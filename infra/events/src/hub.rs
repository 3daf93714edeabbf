use crate::config::{HubConfig, MatchPolicy};
use crate::handler::{Event, Handler};
use crate::registry::{
    AnyRegistry, FailureHook, HandlerFailure, RaiseReport, Settings, WeakHandlerRegistry,
};
use crate::subscription::Subscription;
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::any::{TypeId, type_name};
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug, Default)]
struct HubInner {
    registries: RwLock<FxHashMap<TypeId, Arc<dyn AnyRegistry>>>,
    settings: Settings,
}

/// A synchronous, thread-safe event hub.
///
/// Routes handlers and events by the [`TypeId`] of the event and keeps one
/// [`WeakHandlerRegistry`] per event type, created on the first registration.
/// Cloning the hub is cheap; clones share the same registries.
///
/// None of the hub operations fail: duplicate registrations and unknown
/// unregister targets are ignored, and handler panics are absorbed.
///
/// # Examples
/// ```rust
/// use dhub_events::{EventHub, Handler};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// struct WeatherChanged;
///
/// let hub = EventHub::new();
/// let fired = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&fired);
///
/// hub.register(Handler::from_fn(move |_: &WeatherChanged| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// }));
/// hub.raise(WeatherChanged);
///
/// assert_eq!(fired.load(Ordering::SeqCst), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    /// Creates an empty hub with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty hub using `config`.
    #[must_use]
    pub fn with_config(config: &HubConfig) -> Self {
        Self::from_settings(Settings::new(config, None))
    }

    /// Returns a builder for a hub with a failure hook or custom settings.
    #[must_use = "The builder must be built to produce a hub"]
    pub fn builder() -> EventHubBuilder {
        EventHubBuilder::default()
    }

    fn from_settings(settings: Settings) -> Self {
        Self { inner: Arc::new(HubInner { registries: RwLock::default(), settings }) }
    }

    /// Registers `handler` for events of type `E`.
    pub fn register<E: Event>(&self, handler: Handler<E>) {
        self.registry_or_insert::<E>().register(handler);
    }

    /// Registers `handler` and returns a guard that unregisters it on drop.
    ///
    /// The guard is bound to the current registry for `E`: after [`clear`](Self::clear)
    /// dropping it has no effect.
    pub fn subscribe<E: Event>(&self, handler: Handler<E>) -> Subscription {
        self.registry_or_insert::<E>().subscribe(handler)
    }

    /// Removes the first registration matching `handler`. No-op if `E` was
    /// never registered or nothing matches.
    pub fn unregister<E: Event>(&self, handler: &Handler<E>) {
        if let Some(registry) = self.registry::<E>() {
            registry.unregister(handler);
        }
    }

    /// Delivers `event` to every live handler of `E`, in registration order.
    pub fn raise<E: Event>(&self, event: E) -> RaiseReport {
        self.raise_arc(Arc::new(event))
    }

    /// Delivers a shared event without re-wrapping.
    pub fn raise_arc<E: Event>(&self, event: Arc<E>) -> RaiseReport {
        self.registry::<E>().map_or_else(
            || {
                trace!(event = type_name::<E>(), "Event dropped: no registered handlers");
                RaiseReport::default()
            },
            |registry| registry.raise_arc(event),
        )
    }

    /// Drops every registry. A later `register` starts from an empty list.
    ///
    /// Handlers of a raise already in progress are not called after this returns.
    pub fn clear(&self) {
        let registries: Vec<_> = self.inner.registries.write().drain().map(|(_, r)| r).collect();
        for registry in &registries {
            registry.clear();
        }
        trace!(event_types = registries.len(), "Event hub cleared");
    }

    /// Prunes dead handlers in every registry. Returns the number removed.
    pub fn purge(&self) -> usize {
        let registries: Vec<_> = self.inner.registries.read().values().cloned().collect();
        registries.iter().map(|registry| registry.prune()).sum()
    }

    /// Number of records held for `E`, including dead ones not yet pruned.
    #[must_use]
    pub fn handler_count<E: Event>(&self) -> usize {
        self.registry::<E>().map_or(0, |registry| registry.len())
    }

    /// Whether a registry exists for `E`.
    #[must_use]
    pub fn contains<E: Event>(&self) -> bool {
        self.inner.registries.read().contains_key(&TypeId::of::<E>())
    }

    /// Number of event types with a registry.
    #[must_use]
    pub fn event_type_count(&self) -> usize {
        self.inner.registries.read().len()
    }

    fn registry<E: Event>(&self) -> Option<Arc<WeakHandlerRegistry<E>>> {
        let registry = self.inner.registries.read().get(&TypeId::of::<E>()).cloned()?;
        downcast::<E>(registry)
    }

    fn registry_or_insert<E: Event>(&self) -> Arc<WeakHandlerRegistry<E>> {
        if let Some(registry) = self.registry::<E>() {
            return registry;
        }

        let mut registries = self.inner.registries.write();
        let entry = registries.entry(TypeId::of::<E>()).or_insert_with(|| {
            trace!(event = type_name::<E>(), "Initializing new handler registry");
            let fresh: Arc<dyn AnyRegistry> =
                Arc::new(WeakHandlerRegistry::<E>::with_settings(self.inner.settings.clone()));
            fresh
        });

        if let Some(registry) = downcast::<E>(Arc::clone(entry)) {
            return registry;
        }

        warn!(event = type_name::<E>(), "Handler registry type mismatch; replacing registry");
        let registry = Arc::new(WeakHandlerRegistry::<E>::with_settings(self.inner.settings.clone()));
        let erased: Arc<dyn AnyRegistry> = registry.clone();
        *entry = erased;
        registry
    }
}

fn downcast<E: Event>(registry: Arc<dyn AnyRegistry>) -> Option<Arc<WeakHandlerRegistry<E>>> {
    registry.into_any().downcast::<WeakHandlerRegistry<E>>().ok()
}

/// Builder for an [`EventHub`] or a standalone [`WeakHandlerRegistry`].
#[derive(Default)]
pub struct EventHubBuilder {
    config: HubConfig,
    hook: Option<FailureHook>,
}

impl EventHubBuilder {
    /// Replaces all settings with `config`.
    #[must_use]
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how handler identities are compared.
    #[must_use]
    pub const fn match_policy(mut self, policy: MatchPolicy) -> Self {
        self.config.match_policy = policy;
        self
    }

    /// Enables or disables `warn!` records for absorbed failures.
    #[must_use]
    pub const fn log_failures(mut self, enabled: bool) -> Self {
        self.config.log_failures = enabled;
        self
    }

    /// Installs a diagnostic hook called for every absorbed handler failure.
    ///
    /// The hook runs on the raising thread after the failed handler returned.
    /// A panic inside the hook is itself absorbed.
    #[must_use]
    pub fn on_failure(mut self, hook: impl Fn(&HandlerFailure) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn build(self) -> EventHub {
        EventHub::from_settings(Settings::new(&self.config, self.hook))
    }

    /// Builds a standalone single-type registry with the same settings.
    #[must_use]
    pub fn build_registry<E: Event>(self) -> WeakHandlerRegistry<E> {
        WeakHandlerRegistry::with_settings(Settings::new(&self.config, self.hook))
    }
}

impl fmt::Debug for EventHubBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHubBuilder")
            .field("config", &self.config)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Opened;
    struct Closed;

    fn counting<E: Event>(counter: &Arc<AtomicUsize>) -> Handler<E> {
        let counter = Arc::clone(counter);
        Handler::from_fn(move |_: &E| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_registry_is_created_lazily() {
        let hub = EventHub::new();
        assert!(!hub.contains::<Opened>());

        hub.raise(Opened);
        hub.unregister(&Handler::<Opened>::from_fn(|_| {}));
        assert_eq!(hub.event_type_count(), 0, "raise/unregister must not create registries");

        hub.register(Handler::<Opened>::from_fn(|_| {}));
        assert!(hub.contains::<Opened>());
        assert_eq!(hub.event_type_count(), 1);
    }

    #[test]
    fn test_routes_by_event_type() {
        let hub = EventHub::new();
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        hub.register(counting::<Opened>(&opened));
        hub.register(counting::<Closed>(&closed));

        hub.raise(Opened);
        hub.raise(Opened);
        hub.raise(Closed);

        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_drops_registries() {
        let hub = EventHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        hub.register(counting::<Opened>(&counter));
        hub.register(counting::<Closed>(&counter));

        hub.clear();
        assert_eq!(hub.event_type_count(), 0);
        assert_eq!(hub.raise(Opened), RaiseReport::default());
        assert_eq!(hub.raise(Closed), RaiseReport::default());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        hub.register(counting::<Opened>(&counter));
        assert_eq!(hub.handler_count::<Opened>(), 1);
    }

    #[test]
    fn test_clear_during_raise_skips_remaining_handlers() {
        let hub = EventHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = hub.clone();
        hub.register(Handler::<Opened>::from_fn(move |_| inner.clear()));
        hub.register(counting::<Opened>(&counter));

        let report = hub.raise(Opened);
        assert_eq!(report.delivered, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!hub.contains::<Opened>());
    }

    #[test]
    fn test_clones_share_state() {
        let hub = EventHub::new();
        let other = hub.clone();
        let counter = Arc::new(AtomicUsize::new(0));
        other.register(counting::<Opened>(&counter));

        hub.raise(Opened);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_purge_prunes_every_type() {
        let hub = EventHub::new();
        let owner = Arc::new(());
        hub.register(Handler::bound_with(&owner, |_: &(), _: &Opened| {}));
        hub.register(Handler::bound_with(&owner, |_: &(), _: &Closed| {}));
        drop(owner);

        assert_eq!(hub.purge(), 2);
        assert_eq!(hub.handler_count::<Opened>(), 0);
        assert_eq!(hub.handler_count::<Closed>(), 0);
    }

    #[test]
    fn test_builder_applies_hook() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let hub = EventHub::builder()
            .log_failures(false)
            .on_failure(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        hub.register(Handler::<Opened>::from_fn(|_| panic!("opened handler failed")));
        let report = hub.raise(Opened);

        assert_eq!(report.failed, 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
