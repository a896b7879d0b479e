//! Named worker threads with cooperative cancellation
//!
//! A [`Task`] owns one OS thread. The body receives a [`StopSignal`] and is
//! expected to check it at the top of every loop iteration. Dropping a task
//! requests a stop and joins the thread.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

/// Shared flag asking one or more tasks to wind down
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create a signal in the "keep running" state
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this signal to stop
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Task failures
#[derive(Error, Debug)]
pub enum TaskError {
    /// The body panicked instead of returning
    #[error("Task '{0}' panicked")]
    Panicked(&'static str),

    /// The task was already joined
    #[error("Task '{0}' already joined")]
    AlreadyJoined(&'static str),
}

/// Handle to a running worker thread
pub struct Task<T> {
    name: &'static str,
    stop: StopSignal,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Task<T> {
    /// Spawn `body` on a named thread sharing `stop`
    pub fn spawn<F>(name: &'static str, stop: StopSignal, body: F) -> io::Result<Self>
    where
        F: FnOnce(StopSignal) -> T + Send + 'static,
    {
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_stop))?;

        log::debug!("Spawned task '{name}'");
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the task to stop without waiting for it
    pub fn request_stop(&self) {
        self.stop.request();
    }

    /// Whether the body has returned (or panicked)
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the body to return and take its result
    pub fn join(mut self) -> Result<T, TaskError> {
        self.join_inner()
    }

    /// Request a stop, then wait for the body to return
    pub fn stop(mut self) -> Result<T, TaskError> {
        self.stop.request();
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<T, TaskError> {
        let handle = self.handle.take().ok_or(TaskError::AlreadyJoined(self.name))?;
        let result = handle.join().map_err(|_| TaskError::Panicked(self.name));
        log::debug!("Joined task '{}'", self.name);
        result
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.request();
            if handle.join().is_err() {
                log::error!("Task '{}' panicked during shutdown", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_request_ends_loop() {
        let task = Task::spawn("counter", StopSignal::new(), |stop| {
            let mut ticks = 0u64;
            while !stop.is_requested() {
                ticks += 1;
                thread::sleep(Duration::from_millis(1));
            }
            ticks
        })
        .unwrap();

        thread::sleep(Duration::from_millis(10));
        assert!(!task.is_finished());
        let ticks = task.stop().unwrap();
        assert!(ticks > 0);
    }

    #[test]
    fn shared_signal_stops_sibling() {
        let signal = StopSignal::new();
        let sibling = Task::spawn("sibling", signal.clone(), |stop| {
            while !stop.is_requested() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        let leader = Task::spawn("leader", signal.clone(), |stop| stop.request()).unwrap();
        leader.join().unwrap();
        sibling.join().unwrap();
        assert!(signal.is_requested());
    }

    #[test]
    fn panic_is_reported() {
        let task = Task::spawn("doomed", StopSignal::new(), |_| -> u32 { panic!("boom") }).unwrap();
        assert!(matches!(task.join(), Err(TaskError::Panicked("doomed"))));
    }
}
