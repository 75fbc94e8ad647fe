//! File I/O layer: the I/O thread, entry file handles and the manager
//! executing open/read/write/doom/close on them.

pub mod handle;
pub mod manager;
pub mod thread;

pub use handle::{CacheFileHandle, HandleRegistry};
pub use manager::{CacheFileIoListener, CacheFileIoManager, OpenMode};
pub use thread::{CacheIoThread, IoLevel};
