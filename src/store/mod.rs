//! Shared store: hand-off queues and the per-task status record.

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::InMemoryStore;
pub use redis::RedisStore;
pub use traits::{QueueName, SharedStore, task_key};
