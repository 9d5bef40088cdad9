//! Distributed lock built on the store client.
mod distributed_lock;
mod heartbeat;
mod options;

pub use distributed_lock::*;
pub use heartbeat::HeartbeatRegistry;
pub(crate) use heartbeat::HeartbeatSettings;
pub(crate) use heartbeat::Lease;
pub use options::*;

#[cfg(test)]
mod heartbeat_test;
