//! Key-value access: the backend seam, its Redis and in-memory
//! implementations, and the document-level client.
mod backend;
mod batch;
mod client;
mod memory;
mod pool;
mod redis_backend;
mod scope;

pub use backend::*;
pub use batch::*;
pub use client::*;
pub use memory::*;
pub use pool::*;
pub use redis_backend::*;
pub use scope::*;

#[cfg(test)]
mod client_test;
