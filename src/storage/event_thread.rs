//! Named threads running queued tasks in order

use std::sync::mpsc;
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;

use crate::error::{CacheError, CacheResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A thread draining a FIFO channel of tasks
///
/// The storage service owns two: the management thread and the thread
/// delivering consumer callbacks.
pub struct EventThread {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl EventThread {
    pub fn new(name: &str) -> CacheResult<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })?;
        let thread_id = handle.thread().id();
        tracing::debug!("Event thread {} started", name);

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Queue a task; fails with `NotInitialized` after shutdown
    pub fn dispatch<F>(&self, task: F) -> CacheResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(CacheError::NotInitialized)?;
        sender
            .send(Box::new(task))
            .map_err(|_| CacheError::NotInitialized)
    }

    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Stop accepting tasks, run the queued ones and join
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }

        if self.is_current_thread() {
            // The loop ends on its own once the channel drains
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Event thread {} panicked", self.name);
            }
        }
        tracing::debug!("Event thread {} stopped", self.name);
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
