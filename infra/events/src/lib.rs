//! # Event Hub
//!
//! A synchronous, type-safe, in-process event hub whose handlers do not keep
//! their owners alive.
//!
//! ## Overview
//!
//! Components register a [`Handler`] for an event type and other components
//! raise events of that type. A handler bound to an owner holds only a
//! [`Weak`](std::sync::Weak) reference to it: once the owner is dropped the
//! handler stops firing and is forgotten, without an explicit unregister.
//!
//! ## Features
//!
//! * **Type-Safe**: Events are identified by their Rust type.
//! * **Weak ownership**: Bound handlers never extend their owner's lifetime.
//! * **Ordered**: Handlers fire in registration order; pruning never reorders.
//! * **Isolated**: A panicking handler neither stops the others nor reaches the raiser.
//! * **Thread affinity**: Owners can demand that their handlers run on their own thread.
//! * **Thread-safe**: `FxHashMap` + `parking_lot` locks, no lock held while handlers run.
//!
//! # Example
//!
//! ```rust
//! use dhub_events::{EventHub, Handler};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CustomerChanged { id: u64 }
//!
//! #[derive(Default)]
//! struct Dashboard { refreshes: AtomicUsize }
//!
//! impl Dashboard {
//!     fn on_customer(&self, _: &CustomerChanged) {
//!         self.refreshes.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let hub = EventHub::new();
//! let dashboard = Arc::new(Dashboard::default());
//!
//! hub.register(Handler::bound(&dashboard, Dashboard::on_customer));
//! hub.raise(CustomerChanged { id: 42 });
//! assert_eq!(dashboard.refreshes.load(Ordering::SeqCst), 1);
//!
//! // No unregister needed: dropping the owner retires the handler.
//! drop(dashboard);
//! let report = hub.raise(CustomerChanged { id: 43 });
//! assert_eq!(report.delivered, 0);
//! assert_eq!(hub.handler_count::<CustomerChanged>(), 0);
//! ```

mod affinity;
mod config;
mod error;
pub mod global;
mod handler;
mod hub;
mod registry;
mod subscription;

pub use affinity::{DispatchThread, Job, ThreadAffinity};
pub use config::{ENV_PREFIX, HubConfig, MatchPolicy};
pub use error::{EventHubError, EventHubErrorExt, Result};
pub use handler::{Event, Handler, HandlerId};
pub use hub::{EventHub, EventHubBuilder};
pub use registry::{FailureHook, HandlerFailure, RaiseReport, WeakHandlerRegistry};
pub use subscription::Subscription;
