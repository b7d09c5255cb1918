//! Threading Primitives
//!
//! Named service threads used by device streams and request workers.

use std::thread::{self, JoinHandle};

use crate::{DeviceError, DeviceResult};

/// Named thread that is joined on drop.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Thread {
    /// Spawn a new thread with the given name and function
    pub fn spawn<F>(name: impl Into<String>, f: F) -> DeviceResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|source| DeviceError::ThreadSpawn { name: name.clone(), source })?;

        Ok(Self {
            handle: Some(handle),
            name,
        })
    }

    /// Get the thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the thread has finished
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait for the thread to exit.
    ///
    /// Joining from the thread itself detaches it instead of deadlocking; this
    /// happens when the last owner of a service is dropped by one of its own
    /// callbacks.
    pub fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            log::debug!("thread '{}' released from within itself; detaching", self.name);
            return;
        }
        if handle.join().is_err() {
            log::error!("thread '{}' panicked", self.name);
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.join();
    }
}

/// Number of worker threads to use when the caller asks for "one per core"
pub fn default_worker_count() -> usize {
    rayon::current_num_threads().max(1)
}
