// # State Store Implementations
//
// Implementations of the StateStore trait: the shared-directory store used
// between the initializer and the watcher, and an in-memory store.

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
