//! The cache I/O thread
//!
//! A single named thread that owns every blocking file operation. Work is
//! queued per priority level and, before each event, the loop picks the
//! lowest non-empty level again. Higher priority work therefore preempts
//! lower priority work between events, never in the middle of one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::constants::IO_THREAD_NAME;
use crate::error::{CacheError, CacheResult};

/// Priority levels of the I/O thread, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IoLevel {
    /// Opens requested with the priority flag
    OpenPriority = 0,
    /// Reads of files opened with the priority flag
    ReadPriority,
    Open,
    Read,
    /// Opens that create a fresh file, nobody waits for existing data
    OpenTruncate,
    Write,
    /// Handle close and doomed file removal
    Close,
    /// Bulk removal of files
    Evict,
}

pub const LEVEL_COUNT: usize = 8;

impl IoLevel {
    fn index(self) -> usize {
        self as usize
    }

    fn from_index(index: usize) -> Self {
        match index {
            0 => IoLevel::OpenPriority,
            1 => IoLevel::ReadPriority,
            2 => IoLevel::Open,
            3 => IoLevel::Read,
            4 => IoLevel::OpenTruncate,
            5 => IoLevel::Write,
            6 => IoLevel::Close,
            _ => IoLevel::Evict,
        }
    }
}

type IoEvent = Box<dyn FnOnce() + Send + 'static>;

struct Queues {
    levels: [VecDeque<IoEvent>; LEVEL_COUNT],
    current: Option<IoLevel>,
    shutdown: bool,
}

impl Queues {
    fn first_pending(&self) -> Option<usize> {
        self.levels.iter().position(|q| !q.is_empty())
    }
}

struct Shared {
    queues: Mutex<Queues>,
    cond: Condvar,
}

/// Dedicated thread executing I/O events by priority level
pub struct CacheIoThread {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl CacheIoThread {
    /// Spawn the I/O thread
    pub fn new() -> CacheResult<Self> {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues {
                levels: Default::default(),
                current: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let loop_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(IO_THREAD_NAME.to_string())
            .spawn(move || thread_loop(loop_shared))?;
        let thread_id = handle.thread().id();

        tracing::debug!("Cache I/O thread started");

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Queue an event at the given level
    ///
    /// Fails with `NotInitialized` once shutdown has begun.
    pub fn dispatch<F>(&self, level: IoLevel, event: F) -> CacheResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queues = self.shared.queues.lock();
        if queues.shutdown {
            return Err(CacheError::NotInitialized);
        }
        queues.levels[level.index()].push_back(Box::new(event));
        self.shared.cond.notify_one();
        Ok(())
    }

    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Level of the event currently executing, if any
    pub fn current_level(&self) -> Option<IoLevel> {
        self.shared.queues.lock().current
    }

    /// Whether an event of higher priority than the running one is waiting
    ///
    /// Long running events (bulk eviction) poll this and re-queue themselves.
    pub fn yield_requested(&self) -> bool {
        let queues = self.shared.queues.lock();
        match (queues.current, queues.first_pending()) {
            (Some(current), Some(pending)) => pending < current.index(),
            _ => false,
        }
    }

    /// Stop accepting events, run what is queued and join the thread
    pub fn shutdown(&self) {
        {
            let mut queues = self.shared.queues.lock();
            if queues.shutdown {
                return;
            }
            queues.shutdown = true;
            self.shared.cond.notify_all();
        }

        if self.is_current_thread() {
            // Cannot join ourselves; the loop exits once the queues drain.
            return;
        }

        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Cache I/O thread panicked");
            }
        }
        tracing::debug!("Cache I/O thread stopped");
    }
}

impl Drop for CacheIoThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn thread_loop(shared: Arc<Shared>) {
    loop {
        let event = {
            let mut queues = shared.queues.lock();
            queues.current = None;
            loop {
                if let Some(index) = queues.first_pending() {
                    let event = queues.levels[index].pop_front();
                    queues.current = Some(IoLevel::from_index(index));
                    break event;
                }
                if queues.shutdown {
                    break None;
                }
                shared.cond.wait(&mut queues);
            }
        };

        match event {
            Some(event) => event(),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_events_run_on_io_thread() {
        let thread = CacheIoThread::new().unwrap();
        let (tx, rx) = mpsc::channel();
        thread
            .dispatch(IoLevel::Read, move || {
                tx.send(std::thread::current().name().map(str::to_string)).unwrap();
            })
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some(IO_THREAD_NAME));
        assert!(!thread.is_current_thread());
    }

    #[test]
    fn test_priority_order() {
        let thread = CacheIoThread::new().unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();

        // Block the thread so the following events queue up.
        thread
            .dispatch(IoLevel::Write, move || {
                gate_rx.recv().unwrap();
            })
            .unwrap();

        for (level, tag) in [
            (IoLevel::Close, "close"),
            (IoLevel::Write, "write"),
            (IoLevel::Read, "read"),
            (IoLevel::OpenPriority, "open-priority"),
            (IoLevel::Read, "read-2"),
        ] {
            let tx = tx.clone();
            thread.dispatch(level, move || tx.send(tag).unwrap()).unwrap();
        }
        gate_tx.send(()).unwrap();

        let order: Vec<_> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["open-priority", "read", "read-2", "write", "close"]);
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let thread = CacheIoThread::new().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            thread.dispatch(IoLevel::Write, move || tx.send(i).unwrap()).unwrap();
        }
        thread.shutdown();
        assert_eq!(rx.try_iter().count(), 10);
        assert!(matches!(
            thread.dispatch(IoLevel::Write, || {}),
            Err(CacheError::NotInitialized)
        ));
    }
}
