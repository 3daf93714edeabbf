use crate::affinity::{Job, ThreadAffinity};
use crate::config::MatchPolicy;
use crate::error::{EventHubError, panic_message};
use parking_lot::Mutex;
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

/// Marker trait for types that can be raised through the hub.
///
/// Any type that is `Send + Sync + 'static` automatically implements this trait.
pub trait Event: Any + Send + Sync + 'static {}
impl<T: Any + Send + Sync + 'static> Event for T {}

/// Stable token identifying a registered callback.
///
/// Named functions and methods are keyed by their item type, which is unique
/// per function regardless of how the compiler lays out their code. Closures
/// passed to [`Handler::from_fn`] or [`Handler::bound_with`] are keyed by their
/// allocation. `owner` is the address of the owning allocation for weakly
/// bound handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    key: Key,
    name: &'static str,
    owner: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    Item(TypeId),
    Alloc(usize),
}

impl HandlerId {
    fn item<F: 'static>(owner: Option<usize>) -> Self {
        Self { key: Key::Item(TypeId::of::<F>()), name: type_name::<F>(), owner }
    }

    fn alloc<F: ?Sized>(func: &Arc<F>, owner: Option<usize>) -> Self {
        Self {
            key: Key::Alloc(Arc::as_ptr(func).cast::<()>().addr()),
            name: type_name::<F>(),
            owner,
        }
    }

    /// Type name of the bound function or closure.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Address of the owning instance, if the handler is bound to one.
    #[must_use]
    pub const fn owner(&self) -> Option<usize> {
        self.owner
    }

    /// Whether two ids denote the same subscription under `policy`.
    #[must_use]
    pub fn matches(&self, other: &Self, policy: MatchPolicy) -> bool {
        match policy {
            MatchPolicy::Method => self.key == other.key,
            MatchPolicy::OwnerAndMethod => self.key == other.key && self.owner == other.owner,
        }
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        if let Key::Alloc(addr) = self.key {
            write!(f, "#{addr:#x}")?;
        }
        match self.owner {
            Some(owner) => write!(f, "@{owner:#x}"),
            None => Ok(()),
        }
    }
}

/// Result of a single handler invocation. Never an error for the raiser.
#[derive(Debug)]
pub(crate) enum Invocation {
    Completed,
    /// The owner was reclaimed between the liveness check and the call.
    Skipped,
    Failed(EventHubError),
}

/// A callback registered for events of type `E`.
///
/// Handlers bound to an owner keep only a [`Weak`] reference to it: once the
/// last `Arc` of the owner is dropped the handler is dead and the registry
/// forgets it on its next mutation or raise. Cloning a handler is cheap and
/// keeps its identity, so a clone can be used to unregister the original.
///
/// `free`, `bound` and `affine` take a named function or method (or a
/// non-capturing closure). Function pointers and capturing closures are
/// rejected at compile time, since their type does not identify them.
pub struct Handler<E: Event> {
    id: HandlerId,
    target: Target<E>,
}

enum Target<E> {
    Unowned(Arc<dyn Fn(&E) + Send + Sync>),
    Bound(Arc<dyn Binding<E>>),
}

impl<E: Event> Handler<E> {
    /// A free function handler. It has no owner and is never pruned.
    ///
    /// # Examples
    /// ```rust
    /// use dhub_events::{EventHub, Handler};
    ///
    /// struct Tick;
    /// fn on_tick(_: &Tick) {}
    ///
    /// let hub = EventHub::new();
    /// hub.register(Handler::free(on_tick));
    /// hub.raise(Tick);
    /// ```
    #[must_use]
    pub fn free<F>(func: F) -> Self
    where
        F: Fn(&E) + Copy + Send + Sync + 'static,
    {
        const { assert!(size_of::<F>() == 0, "free handlers must be named functions") };
        Self { id: HandlerId::item::<F>(None), target: Target::Unowned(Arc::new(func)) }
    }

    /// A closure owned by the hub. It is never pruned; every call to
    /// `from_fn` produces a distinct identity, so keep a clone to unregister it.
    #[must_use]
    pub fn from_fn<F>(func: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let func: Arc<dyn Fn(&E) + Send + Sync> = Arc::new(func);
        Self { id: HandlerId::alloc(&func, None), target: Target::Unowned(func) }
    }

    /// A method bound weakly to `owner`.
    ///
    /// # Examples
    /// ```rust
    /// use dhub_events::{EventHub, Handler};
    /// use std::sync::Arc;
    ///
    /// struct Invoice;
    /// struct Ledger;
    /// impl Ledger {
    ///     fn on_invoice(&self, _: &Invoice) {}
    /// }
    ///
    /// let hub = EventHub::new();
    /// let ledger = Arc::new(Ledger);
    /// hub.register(Handler::bound(&ledger, Ledger::on_invoice));
    /// assert_eq!(hub.handler_count::<Invoice>(), 1);
    ///
    /// drop(ledger);
    /// hub.raise(Invoice);
    /// assert_eq!(hub.handler_count::<Invoice>(), 0);
    /// ```
    #[must_use]
    pub fn bound<O, M>(owner: &Arc<O>, method: M) -> Self
    where
        O: Send + Sync + 'static,
        M: Fn(&O, &E) + Copy + Send + Sync + 'static,
    {
        const { assert!(size_of::<M>() == 0, "bound handlers must be named methods") };
        Self::weak::<O, M>(owner, Arc::new(method), None)
    }

    /// A closure bound weakly to `owner`. Identity is unique per call.
    #[must_use]
    pub fn bound_with<O, F>(owner: &Arc<O>, func: F) -> Self
    where
        O: Send + Sync + 'static,
        F: Fn(&O, &E) + Send + Sync + 'static,
    {
        let func: Arc<dyn Fn(&O, &E) + Send + Sync> = Arc::new(func);
        let weak = Arc::downgrade(owner);
        let id = HandlerId::alloc(&func, Some(owner_addr(&weak)));
        Self::with_binding(id, weak, func, None)
    }

    /// A method bound weakly to an owner with thread affinity. When the
    /// owner reports [`ThreadAffinity::invoke_required`], the call is marshaled
    /// onto its context and the raiser blocks until it returns.
    #[must_use]
    pub fn affine<O, M>(owner: &Arc<O>, method: M) -> Self
    where
        O: ThreadAffinity + 'static,
        M: Fn(&O, &E) + Copy + Send + Sync + 'static,
    {
        const { assert!(size_of::<M>() == 0, "affine handlers must be named methods") };
        Self::weak::<O, M>(owner, Arc::new(method), Some(as_affinity::<O>))
    }

    fn weak<O, M>(
        owner: &Arc<O>,
        callback: Callback<O, E>,
        affinity: Option<fn(&O) -> &dyn ThreadAffinity>,
    ) -> Self
    where
        O: Send + Sync + 'static,
        M: 'static,
    {
        let weak = Arc::downgrade(owner);
        let id = HandlerId::item::<M>(Some(owner_addr(&weak)));
        Self::with_binding(id, weak, callback, affinity)
    }

    fn with_binding<O>(
        id: HandlerId,
        owner: Weak<O>,
        callback: Callback<O, E>,
        affinity: Option<fn(&O) -> &dyn ThreadAffinity>,
    ) -> Self
    where
        O: Send + Sync + 'static,
    {
        let binding: Arc<dyn Binding<E>> = Arc::new(WeakBinding { owner, callback, affinity });
        Self { id, target: Target::Bound(binding) }
    }

    /// Identity used for deduplication and removal.
    #[must_use]
    pub const fn id(&self) -> HandlerId {
        self.id
    }

    /// `true` if the handler has no owner or its owner is still reachable.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match &self.target {
            Target::Unowned(_) => true,
            Target::Bound(binding) => binding.is_alive(),
        }
    }

    /// Calls the handler. Panics are caught here and reported as
    /// [`Invocation::Failed`]; they never reach the raiser.
    pub(crate) fn invoke(&self, event: &Arc<E>) -> Invocation {
        match &self.target {
            Target::Unowned(func) => guarded(|| func(&**event)),
            Target::Bound(binding) => binding.call(event),
        }
    }

    fn kind(&self) -> &'static str {
        match (&self.target, self.id.key) {
            (Target::Unowned(_), Key::Item(_)) => "free",
            (Target::Unowned(_), Key::Alloc(_)) => "closure",
            (Target::Bound(_), _) => "bound",
        }
    }
}

impl<E: Event> Clone for Handler<E> {
    fn clone(&self) -> Self {
        let target = match &self.target {
            Target::Unowned(func) => Target::Unowned(Arc::clone(func)),
            Target::Bound(binding) => Target::Bound(Arc::clone(binding)),
        };
        Self { id: self.id, target }
    }
}

impl<E: Event> fmt::Debug for Handler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("event", &type_name::<E>())
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("alive", &self.is_alive())
            .finish()
    }
}

type Callback<O, E> = Arc<dyn Fn(&O, &E) + Send + Sync>;

trait Binding<E>: Send + Sync {
    fn is_alive(&self) -> bool;
    fn call(&self, event: &Arc<E>) -> Invocation;
}

struct WeakBinding<O, E> {
    owner: Weak<O>,
    callback: Callback<O, E>,
    affinity: Option<fn(&O) -> &dyn ThreadAffinity>,
}

impl<O, E> Binding<E> for WeakBinding<O, E>
where
    O: Send + Sync + 'static,
    E: Event,
{
    fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }

    fn call(&self, event: &Arc<E>) -> Invocation {
        let Some(owner) = self.owner.upgrade() else {
            return Invocation::Skipped;
        };

        if let Some(affinity_of) = self.affinity {
            let context = affinity_of(&*owner);
            if context.invoke_required() {
                return marshal(context, Arc::clone(&owner), Arc::clone(event), Arc::clone(&self.callback));
            }
        }

        guarded(|| (self.callback)(&*owner, &**event))
    }
}

fn owner_addr<O>(owner: &Weak<O>) -> usize {
    Weak::as_ptr(owner).cast::<()>().addr()
}

fn as_affinity<O: ThreadAffinity>(owner: &O) -> &dyn ThreadAffinity {
    owner
}

fn guarded(call: impl FnOnce()) -> Invocation {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(()) => Invocation::Completed,
        Err(payload) => Invocation::Failed(EventHubError::HandlerPanicked {
            message: panic_message(payload.as_ref()),
            context: None,
        }),
    }
}

fn marshal<O, E>(
    context: &dyn ThreadAffinity,
    owner: Arc<O>,
    event: Arc<E>,
    callback: Callback<O, E>,
) -> Invocation
where
    O: Send + Sync + 'static,
    E: Event,
{
    let outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    let job: Job = Box::new(move || {
        let result = guarded(|| callback(&*owner, &*event));
        *slot.lock() = Some(result);
    });

    match catch_unwind(AssertUnwindSafe(|| context.invoke(job))) {
        Ok(Ok(())) => outcome.lock().take().unwrap_or_else(|| {
            Invocation::Failed(EventHubError::MarshalFailed {
                message: "affinity context returned without running the handler".into(),
                context: None,
            })
        }),
        Ok(Err(error)) => Invocation::Failed(error),
        Err(payload) => Invocation::Failed(EventHubError::MarshalFailed {
            message: panic_message(payload.as_ref()),
            context: Some("affinity context panicked".into()),
        }),
    }
}
