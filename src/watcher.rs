//! The looping watcher: a background activity that repeatedly invokes a
//! user-supplied action at a fixed cadence, with a "wait for one iteration"
//! primitive for callers that need to observe progress.
//!
//! Two controller-internal watchers are built on top of this: the register
//! watcher (drives the CC/CSTS/NSSR state machine) and the doorbell/command
//! watcher (drives the dispatcher). Both share this same primitive; only
//! their action closures differ.
//!
//! Builds with the `single-threaded` feature replace the worker thread with
//! an explicit [`Watcher::tick`] entry point for deterministic tests -
//! `wait_for_flip` becomes `tick(); true`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[cfg(not(feature = "single-threaded"))]
use std::thread::JoinHandle;

type Action = dyn Fn() + Send + Sync;

/// A single dedicated background worker running `while active { action(); toggle_flip(); sleep(interval) }`.
pub struct Watcher {
    action: Box<Action>,
    interval: Duration,
    running: AtomicBool,
    #[cfg(not(feature = "single-threaded"))]
    continue_loop: AtomicBool,
    #[cfg(not(feature = "single-threaded"))]
    running_mutex: Mutex<()>,
    flip: Mutex<bool>,
    flip_condvar: Condvar,
    #[cfg(not(feature = "single-threaded"))]
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new<F>(action: F, interval: Duration) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            action: Box::new(action),
            interval,
            running: AtomicBool::new(false),
            #[cfg(not(feature = "single-threaded"))]
            continue_loop: AtomicBool::new(false),
            #[cfg(not(feature = "single-threaded"))]
            running_mutex: Mutex::new(()),
            flip: Mutex::new(false),
            flip_condvar: Condvar::new(),
            #[cfg(not(feature = "single-threaded"))]
            thread: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn toggle_flip(&self) {
        let mut flip = self.flip.lock().unwrap();
        *flip = !*flip;
        self.flip_condvar.notify_all();
    }

    /// Blocks until the flip bit toggles at least once; returns `false`
    /// immediately if the watcher isn't running.
    #[cfg(not(feature = "single-threaded"))]
    pub fn wait_for_flip(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let guard = self.flip.lock().unwrap();
        let cached = *guard;
        let _unused = self
            .flip_condvar
            .wait_while(guard, |flip| *flip == cached)
            .unwrap();
        true
    }

    /// In cooperative mode there is no background worker: a "wait" is just
    /// an explicit tick.
    #[cfg(feature = "single-threaded")]
    pub fn wait_for_flip(&self) -> bool {
        self.tick();
        true
    }

    /// Cooperative single-threaded entry point: runs the action once and
    /// toggles the flip bit, as one iteration of the loop would.
    #[cfg(feature = "single-threaded")]
    pub fn tick(&self) {
        (self.action)();
        self.toggle_flip();
    }

    #[cfg(not(feature = "single-threaded"))]
    fn loop_body(&self) {
        let _held = self.running_mutex.lock().unwrap();
        while self.continue_loop.load(Ordering::SeqCst) {
            (self.action)();
            self.toggle_flip();
            std::thread::sleep(self.interval);
        }
    }

    /// Starts the worker (idempotent) and blocks until one full iteration
    /// has completed.
    #[cfg(not(feature = "single-threaded"))]
    pub fn start(self: &std::sync::Arc<Self>) {
        if self.is_running() {
            return;
        }
        self.continue_loop.store(true, Ordering::SeqCst);
        let this = self.clone();
        let handle = std::thread::spawn(move || this.loop_body());
        *self.thread.lock().unwrap() = Some(handle);
        self.running.store(true, Ordering::SeqCst);
        self.wait_for_flip();
    }

    /// Marks the watcher running so [`tick`](Watcher::tick) and
    /// [`wait_for_flip`](Watcher::wait_for_flip) behave as documented, and
    /// runs one iteration so a caller observes the same "one iteration
    /// completed" guarantee as the threaded build.
    #[cfg(feature = "single-threaded")]
    pub fn start(self: &std::sync::Arc<Self>) {
        if self.is_running() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        self.tick();
    }

    /// Signals the worker to stop and joins it. Any iteration already in
    /// flight runs to completion first.
    #[cfg(not(feature = "single-threaded"))]
    pub fn end(&self) {
        if !self.is_running() {
            return;
        }
        self.continue_loop.store(false, Ordering::SeqCst);
        // Blocks until loop_body releases running_mutex, i.e. until the
        // in-flight iteration (if any) finishes and the loop condition is
        // re-checked as false.
        drop(self.running_mutex.lock().unwrap());
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    #[cfg(feature = "single-threaded")]
    pub fn end(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
