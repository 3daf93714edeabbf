use dhub_events::{DispatchThread, Job, ThreadAffinity};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeatherChanged {
    pub celsius: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerChanged {
    pub id: u64,
}

/// Counts signals and remembers when the last one happened.
#[derive(Debug)]
pub struct Latch {
    fired: AtomicUsize,
    fired_at: Mutex<Option<Instant>>,
}

impl Latch {
    pub const fn new() -> Self {
        Self { fired: AtomicUsize::new(0), fired_at: Mutex::new(None) }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        *self.fired_at.lock() = Some(Instant::now());
    }

    /// Returns the number of signals since the last call and resets it.
    pub fn take_count(&self) -> usize {
        self.fired.swap(0, Ordering::SeqCst)
    }

    pub fn fired_at(&self) -> Option<Instant> {
        *self.fired_at.lock()
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// An owner whose method handlers signal a shared latch.
#[derive(Debug)]
pub struct Listener {
    pub latch: Arc<Latch>,
}

impl Listener {
    pub fn shared(latch: &Arc<Latch>) -> Arc<Self> {
        Arc::new(Self { latch: Arc::clone(latch) })
    }

    pub fn on_customer(&self, _: &CustomerChanged) {
        self.latch.set();
    }

    pub fn on_weather(&self, _: &WeatherChanged) {
        self.latch.set();
    }

    /// Same body as [`Listener::on_customer`], registered as a separate handler.
    pub fn on_customer_audit(&self, _: &CustomerChanged) {
        self.latch.set();
    }
}

/// An owner that insists on running its handlers on its own thread.
#[derive(Debug)]
pub struct Window {
    pub dispatcher: DispatchThread,
    pub latch: Arc<Latch>,
    pub handled_on: Mutex<Vec<ThreadId>>,
}

impl Window {
    pub fn shared(name: &str, latch: &Arc<Latch>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: DispatchThread::spawn(name).expect("dispatch thread should start"),
            latch: Arc::clone(latch),
            handled_on: Mutex::new(Vec::new()),
        })
    }

    pub fn on_customer(&self, _: &CustomerChanged) {
        self.handled_on.lock().push(std::thread::current().id());
        self.latch.set();
    }

    pub fn on_customer_slow(&self, event: &CustomerChanged) {
        std::thread::sleep(std::time::Duration::from_millis(50));
        self.on_customer(event);
    }

    pub fn on_customer_panics(&self, _: &CustomerChanged) {
        panic!("window handler failed");
    }
}

impl ThreadAffinity for Window {
    fn invoke_required(&self) -> bool {
        self.dispatcher.invoke_required()
    }

    fn invoke(&self, job: Job) -> dhub_events::Result<()> {
        self.dispatcher.invoke(job)
    }
}

/// Installs a test-friendly tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
