//! Named background threads with a bounded join
//!
//! `std::thread::JoinHandle::join` has no timeout, so each worker carries an
//! exit signal: a channel whose sender is dropped when the thread body returns
//! or unwinds. [`Worker::join_timeout`] waits on that signal first and only
//! joins once the thread is known to be done. A worker that misses the
//! deadline is detached; its thread keeps running until its own loop notices
//! the shutdown flag.

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to a spawned worker thread
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    exited: Receiver<()>,
}

impl Worker {
    /// Spawn a named worker thread
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (exit_tx, exited) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // Dropped on return or unwind
                let _exit_guard = exit_tx;
                body();
            })?;

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            exited,
        })
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for the thread to exit
    ///
    /// Returns `true` if the thread exited (and was joined), `false` if it was
    /// detached after the deadline.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    log::error!("Worker '{}' panicked", self.name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Worker '{}' did not exit within {:?}, detaching",
                    self.name,
                    timeout
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_join_after_exit() {
        let worker = Worker::spawn("test-quick", || {}).unwrap();
        assert_eq!(worker.name(), "test-quick");
        assert!(worker.join_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_detach_on_timeout() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let worker = Worker::spawn("test-stuck", move || {
            while !flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        assert!(!worker.join_timeout(Duration::from_millis(30)));
        release.store(true, Ordering::Relaxed);
    }

    #[test]
    fn test_panicking_worker_still_joins() {
        let worker = Worker::spawn("test-panic", || panic!("boom")).unwrap();
        assert!(worker.join_timeout(Duration::from_secs(1)));
    }
}
