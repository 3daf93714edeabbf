//! Thread-affinity capability for handler owners.
//!
//! Some owners may only be touched from the thread (or loop) that created
//! them. Such owners implement [`ThreadAffinity`] and register through
//! [`Handler::affine`](crate::Handler::affine); every raise then hops onto the
//! owner's context and blocks until the handler has returned.

use crate::error::{EventHubError, Result, panic_message};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle, ThreadId};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// A unit of work marshaled onto an affinity context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Capability exposed by owners that require their handlers to run on a
/// specific thread or loop.
pub trait ThreadAffinity: Send + Sync {
    /// Returns `true` when the calling thread is not the owner's context and
    /// the call must be marshaled.
    fn invoke_required(&self) -> bool;

    /// Runs `job` on the owner's context, blocking the caller until it completes.
    ///
    /// # Errors
    /// Returns [`EventHubError::MarshalFailed`] if the context is gone, or
    /// [`EventHubError::HandlerPanicked`] if the job panicked on that context.
    fn invoke(&self, job: Job) -> Result<()>;
}

struct Envelope {
    job: Job,
    done: Completion,
}

/// Rendezvous between a blocked caller and the dispatch thread.
///
/// Waiting parks the OS thread directly, so it is safe from inside an async
/// runtime as well as from plain threads.
#[derive(Default)]
struct Rendezvous {
    outcome: Mutex<Option<Result<()>>>,
    ready: Condvar,
}

impl Rendezvous {
    fn complete(&self, result: Result<()>) {
        *self.outcome.lock() = Some(result);
        self.ready.notify_one();
    }

    fn wait(&self) -> Result<()> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            self.ready.wait(&mut outcome);
        }
    }
}

/// Sending half of a [`Rendezvous`]. Dropping it unsent wakes the caller
/// with an error, so a discarded job never leaves the caller blocked.
struct Completion(Option<Arc<Rendezvous>>);

impl Completion {
    fn send(mut self, result: Result<()>) {
        if let Some(rendezvous) = self.0.take() {
            rendezvous.complete(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(rendezvous) = self.0.take() {
            rendezvous.complete(Err(EventHubError::MarshalFailed {
                message: "job was discarded before it ran".into(),
                context: Some("dispatch thread".into()),
            }));
        }
    }
}

/// A dedicated thread acting as an affinity context.
///
/// Jobs are executed one at a time in submission order. Dropping the handle
/// closes the queue and joins the thread.
pub struct DispatchThread {
    name: String,
    thread_id: ThreadId,
    sender: Option<mpsc::UnboundedSender<Envelope>>,
    worker: Option<JoinHandle<()>>,
}

impl DispatchThread {
    /// Spawns a named dispatch thread.
    ///
    /// # Errors
    /// Returns [`EventHubError::MarshalFailed`] if the OS refuses to spawn the thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();

        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Some(Envelope { job, done }) = receiver.blocking_recv() {
                    let result = catch_unwind(AssertUnwindSafe(job)).map_err(|payload| {
                        EventHubError::HandlerPanicked {
                            message: panic_message(payload.as_ref()),
                            context: Some("dispatch thread".into()),
                        }
                    });
                    done.send(result);
                }
                trace!("Dispatch thread queue closed");
            })
            .map_err(|e| EventHubError::MarshalFailed {
                message: e.to_string().into(),
                context: Some(format!("Failed to spawn dispatch thread {name}").into()),
            })?;

        trace!(thread = %name, "Dispatch thread started");

        Ok(Self { thread_id: worker.thread().id(), name, sender: Some(sender), worker: Some(worker) })
    }

    /// Returns the thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the id of the dispatch thread.
    #[must_use]
    pub const fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    fn closed(&self) -> EventHubError {
        EventHubError::MarshalFailed {
            message: "dispatch thread is not running".into(),
            context: Some(self.name.clone().into()),
        }
    }
}

impl ThreadAffinity for DispatchThread {
    fn invoke_required(&self) -> bool {
        thread::current().id() != self.thread_id
    }

    fn invoke(&self, job: Job) -> Result<()> {
        if !self.invoke_required() {
            return catch_unwind(AssertUnwindSafe(job)).map_err(|payload| {
                EventHubError::HandlerPanicked {
                    message: panic_message(payload.as_ref()),
                    context: Some("dispatch thread".into()),
                }
            });
        }

        let sender = self.sender.as_ref().ok_or_else(|| self.closed())?;
        let rendezvous = Arc::new(Rendezvous::default());
        let done = Completion(Some(Arc::clone(&rendezvous)));
        if sender.send(Envelope { job, done }).is_err() {
            return Err(self.closed());
        }
        rendezvous.wait()
    }
}

impl fmt::Debug for DispatchThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchThread")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .field("running", &self.sender.is_some())
            .finish()
    }
}

impl Drop for DispatchThread {
    fn drop(&mut self) {
        drop(self.sender.take());
        let Some(worker) = self.worker.take() else { return };
        // The last owner reference may be released by a job on the thread itself.
        if thread::current().id() == self.thread_id {
            return;
        }
        if worker.join().is_err() {
            warn!(thread = %self.name, "Dispatch thread terminated abnormally");
        }
    }
}
