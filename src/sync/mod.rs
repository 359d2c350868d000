//! Concurrency primitives for the operation and callback contexts.

mod lock;
mod queue;

pub use lock::{LockError, ReleaseGuard, ResourceLock};
pub use queue::{QueueError, SerialTaskQueue, Task};
