//! # Background Thread Lifecycle
//!
//! The flusher and fsyncer run as named OS threads coordinated through a
//! single state byte:
//!
//! ```text
//! Init ──spawn──▶ Running ──request_stop──▶ RunningStopRequested ──▶ Stopped
//! ```
//!
//! Spawn blocks until the thread has published `Running`, so a successful
//! `Wal::init` implies both engines are live. Shutdown stores
//! `RunningStopRequested` and joins; the loops poll the byte frequently and
//! abandon in-flight work with a cancellation error at the next boundary.
//! A thread that exits with a non-cancellation error stashes it for
//! `Wal::uninit` to surface.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{eyre, Result, WrapErr};
use parking_lot::Mutex;
use tracing::error;

use crate::error::WalError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Init = 0,
    Running = 1,
    RunningStopRequested = 2,
    Stopped = 3,
}

pub struct ThreadControl {
    state: AtomicU8,
    error: Mutex<Option<eyre::Report>>,
}

impl ThreadControl {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ThreadState::Init as u8),
            error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::Init,
            1 => ThreadState::Running,
            2 => ThreadState::RunningStopRequested,
            _ => ThreadState::Stopped,
        }
    }

    /// True once shutdown has been requested. Loops poll this between
    /// units of work.
    pub fn stop_requested(&self) -> bool {
        self.state() == ThreadState::RunningStopRequested
    }

    fn mark_running(&self) {
        // A stop requested before the thread came up wins the race.
        let _ = self.state.compare_exchange(
            ThreadState::Init as u8,
            ThreadState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn request_stop(&self) {
        self.state
            .store(ThreadState::RunningStopRequested as u8, Ordering::Release);
    }

    fn mark_stopped(&self) {
        self.state
            .store(ThreadState::Stopped as u8, Ordering::Release);
    }

    fn stash_error(&self, err: eyre::Report) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_error(&self) -> Option<eyre::Report> {
        self.error.lock().take()
    }
}

pub struct BackgroundThread {
    name: &'static str,
    control: Arc<ThreadControl>,
    handle: JoinHandle<()>,
}

impl BackgroundThread {
    /// Spawns `body` on a named thread and waits until it reports Running.
    pub fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(&ThreadControl) -> Result<()> + Send + 'static,
    {
        let control = Arc::new(ThreadControl::new());
        let thread_control = Arc::clone(&control);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                thread_control.mark_running();
                if let Err(err) = body(&thread_control) {
                    let cancelled = matches!(
                        err.downcast_ref::<WalError>(),
                        Some(WalError::Cancelled)
                    );
                    if !cancelled {
                        error!(thread = name, error = %err, "background thread failed");
                        thread_control.stash_error(err);
                    }
                }
                thread_control.mark_stopped();
            })
            .wrap_err_with(|| format!("failed to spawn {} thread", name))?;

        while control.state() == ThreadState::Init {
            std::thread::yield_now();
        }

        Ok(Self {
            name,
            control,
            handle,
        })
    }

    /// True once the thread has exited its loop, for any reason.
    pub fn is_stopped(&self) -> bool {
        self.control.state() == ThreadState::Stopped
    }

    /// Requests a cooperative stop, joins, and surfaces the thread's first
    /// fatal error if it had one.
    pub fn stop(self) -> Result<()> {
        self.control.request_stop();
        self.handle
            .join()
            .map_err(|_| eyre!("{} thread panicked", self.name))?;
        match self.control.take_error() {
            Some(err) => Err(err.wrap_err(format!("{} thread failed", self.name))),
            None => Ok(()),
        }
    }
}
