//! Queue module: bounded FIFO of task ids.
//!
//! The queue only carries `TaskId`s. Task state lives in the registry, so a
//! popped id is merely a hint: the worker still has to win the claim.

mod work_queue;

pub use work_queue::{QueueFull, QueuePermit, WorkQueue};
