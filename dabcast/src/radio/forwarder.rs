//! Hand-off of engine callbacks into the tokio runtime.
//!
//! The decoding engine raises its callbacks on its own threads. Nothing that
//! touches controller state may run there, so every callback is turned into an
//! event value, pushed onto an unbounded queue and executed by a dispatch task
//! on the runtime.
//!
//! Each bind starts a new generation. An event is stamped with the generation
//! current when it was raised and only reaches the target if that binding is
//! still in place at dispatch time; events raised under an earlier binding are
//! dropped, even when a new target has been bound since.
//!
//! The forwarder is registered with the engine once and stays registered; the
//! target behind it can be bound, unbound and swapped without touching the
//! engine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, trace};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// An event that knows how to replay itself against a target of type `T`.
pub trait Deliver<T: ?Sized>: Send + 'static {
    fn deliver(self, target: &T);
}

struct Binding<T: ?Sized> {
    target: Option<Arc<T>>,
    generation: u64,
}

type TargetCell<T> = Arc<RwLock<Binding<T>>>;

/// Forwards events of type `E` to a swappable target of type `T`.
pub struct CallbackForwarder<T: ?Sized, E> {
    label: &'static str,
    target: TargetCell<T>,
    tx: mpsc::UnboundedSender<(u64, E)>,
    dropped: Arc<AtomicU64>,
}

impl<T, E> CallbackForwarder<T, E>
where
    T: ?Sized + Send + Sync + 'static,
    E: Deliver<T>,
{
    /// Create an unbound forwarder dispatching on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(label: &'static str) -> Self {
        Self::with_handle(label, &Handle::current())
    }

    /// Create a forwarder already bound to `target`.
    pub fn bound(label: &'static str, target: Arc<T>) -> Self {
        let forwarder = Self::new(label);
        forwarder.bind(target);
        forwarder
    }

    /// Create an unbound forwarder dispatching on the given runtime.
    pub fn with_handle(label: &'static str, handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, E)>();
        let target: TargetCell<T> = Arc::new(RwLock::new(Binding {
            target: None,
            generation: 0,
        }));
        let dropped = Arc::new(AtomicU64::new(0));

        let cell = Arc::clone(&target);
        let dropped_count = Arc::clone(&dropped);
        handle.spawn(async move {
            while let Some((generation, event)) = rx.recv().await {
                // Clone out of the cell so a target may rebind the forwarder
                // from inside its own handler.
                let current = {
                    let binding = cell.read();
                    if binding.generation == generation {
                        binding.target.clone()
                    } else {
                        None
                    }
                };
                match current {
                    Some(target) => {
                        let result = catch_unwind(AssertUnwindSafe(|| event.deliver(&*target)));
                        if let Err(panic_err) = result {
                            error!("[Forwarder:{}] PANIC in event target: {:?}", label, panic_err);
                        }
                    }
                    None => {
                        dropped_count.fetch_add(1, Ordering::Relaxed);
                        trace!(
                            "[Forwarder:{}] Binding {} gone, event dropped",
                            label,
                            generation
                        );
                    }
                }
            }
            trace!("[Forwarder:{}] Dispatcher stopped", label);
        });

        Self {
            label,
            target,
            tx,
            dropped,
        }
    }

    /// Bind a target. Fails if one is already bound.
    pub fn bind(&self, target: Arc<T>) -> bool {
        let mut binding = self.target.write();
        if binding.target.is_some() {
            return false;
        }
        binding.target = Some(target);
        binding.generation += 1;
        true
    }

    /// Clear the bound target. Fails if nothing is bound.
    pub fn unbind(&self) -> bool {
        let mut binding = self.target.write();
        if binding.target.take().is_none() {
            return false;
        }
        binding.generation += 1;
        true
    }

    pub fn is_bound(&self) -> bool {
        self.target.read().target.is_some()
    }

    /// Number of events that reached the dispatcher after the binding they
    /// were raised under had ended.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue an event for the runtime. Callable from any thread, never blocks.
    pub fn forward(&self, event: E) {
        let generation = self.target.read().generation;
        if self.tx.send((generation, event)).is_err() {
            trace!("[Forwarder:{}] Runtime gone, event dropped", self.label);
        }
    }
}

impl<T: ?Sized, E> std::fmt::Debug for CallbackForwarder<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackForwarder")
            .field("label", &self.label)
            .field("bound", &self.target.read().target.is_some())
            .finish()
    }
}
