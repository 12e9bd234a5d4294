//! Supervised worker thread with cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

use crate::sync::Mutex;

const TEARDOWN_POLL: Duration = Duration::from_millis(10);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    NotRunning = 0,
    Running = 1,
    Aborted = 2,
    Deleting = 3,
}

impl ThreadState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ThreadState::Running,
            2 => ThreadState::Aborted,
            3 => ThreadState::Deleting,
            _ => ThreadState::NotRunning,
        }
    }
}

/// State shared between a [`ThreadOwner`] and its worker thread.
pub struct ThreadControl {
    state: AtomicU8,
    alive: AtomicBool,
}

impl ThreadControl {
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// False once a stop was requested; workers poll this in their loop.
    pub fn should_run(&self) -> bool {
        self.state() == ThreadState::Running
    }

    fn transition(&self, from: ThreadState, to: ThreadState) -> ThreadState {
        match self.state.compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(previous) | Err(previous) => ThreadState::from_raw(previous),
        }
    }
}

pub trait ThreadWorker: Send + Sync + 'static {
    /// The payload. Must return once `control.should_run()` turns false,
    /// there is no forced termination.
    fn thread_proc(&self, control: &ThreadControl);

    /// Called after the payload returned, with the state observed just before
    /// it was reset to `NotRunning`.
    fn thread_terminated(&self, previous: ThreadState) {
        let _ = previous;
    }
}

struct Shared<W> {
    control: ThreadControl,
    worker_thread: Mutex<Option<ThreadId>>,
    worker: W,
}

/// Owns zero or one worker thread running `W`.
///
/// Dropping the owner requests a stop for deletion and blocks until the
/// worker thread has fully exited.
pub struct ThreadOwner<W: ThreadWorker> {
    name: String,
    shared: Arc<Shared<W>>,
}

impl<W: ThreadWorker> ThreadOwner<W> {
    pub fn new(name: impl Into<String>, worker: W) -> Self {
        ThreadOwner {
            name: name.into(),
            shared: Arc::new(Shared {
                control: ThreadControl {
                    state: AtomicU8::new(ThreadState::NotRunning as u8),
                    alive: AtomicBool::new(false),
                },
                worker_thread: Mutex::new(None),
                worker,
            }),
        }
    }

    pub fn worker(&self) -> &W {
        &self.shared.worker
    }

    pub fn thread_state(&self) -> ThreadState {
        self.shared.control.state()
    }

    /// True from spawn until the worker finished its termination hook.
    pub fn is_thread_running(&self) -> bool {
        self.shared.control.alive.load(Ordering::SeqCst)
    }

    pub fn start_thread(&self) -> bool {
        let control = &self.shared.control;

        /* claim the thread slot first, a previous worker may still be inside its termination hook */
        if control.alive.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return false;
        }

        if control.transition(ThreadState::NotRunning, ThreadState::Running) != ThreadState::NotRunning {
            control.alive.store(false, Ordering::SeqCst);
            return false;
        }

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_worker(shared));

        match spawned {
            Ok(_) => {
                tracing::debug!(thread = %self.name, "worker thread started");
                true
            }
            Err(error) => {
                tracing::error!(?error, thread = %self.name, "failed to spawn worker thread");
                /* no worker exists, a racing stop may have moved Running on already */
                control.state.store(ThreadState::NotRunning as u8, Ordering::SeqCst);
                control.alive.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Asks a running worker to stop. Returns the state seen before the request.
    pub fn stop_thread(&self, deleting: bool) -> ThreadState {
        let target = if deleting {
            ThreadState::Deleting
        } else {
            ThreadState::Aborted
        };

        self.shared.control.transition(ThreadState::Running, target)
    }
}

impl<W: ThreadWorker> Drop for ThreadOwner<W> {
    fn drop(&mut self) {
        self.stop_thread(true);

        if *self.shared.worker_thread.wait() == Some(std::thread::current().id()) {
            tracing::error!(thread = %self.name, "thread owner dropped on its own worker thread, not waiting for exit");
            return;
        }

        if self.is_thread_running() {
            tracing::debug!(thread = %self.name, "waiting for worker thread to exit");
        }

        while self.is_thread_running() {
            std::thread::sleep(TEARDOWN_POLL);
        }
    }
}

struct ExitGuard<'a>(&'a ThreadControl);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.state.store(ThreadState::NotRunning as u8, Ordering::SeqCst);
        }
        self.0.alive.store(false, Ordering::SeqCst);
    }
}

fn run_worker<W: ThreadWorker>(shared: Arc<Shared<W>>) {
    let _exit = ExitGuard(&shared.control);
    *shared.worker_thread.wait() = Some(std::thread::current().id());

    shared.worker.thread_proc(&shared.control);

    let previous = ThreadState::from_raw(
        shared.control.state.swap(ThreadState::NotRunning as u8, Ordering::SeqCst),
    );
    shared.worker.thread_terminated(previous);
}
