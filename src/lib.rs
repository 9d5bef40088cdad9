//! Schema-driven document layer over a Redis-protocol key-value store.
//!
//! Nested documents are flattened into keys by a versioned schema template,
//! searched with exact, prefix and glob patterns, watched through keyspace
//! notifications, and protected by a fair, liveness-checked distributed
//! lock.
//!
//! ```ignore
//! let ctx = DalContext::connect(DalConfig::new()?)?;
//! let store = ctx.store(Scope::Global)?;
//! store.set(&doc, SetOptions::default(), None).await?;
//!
//! let lock = ctx.lock(LockOptions::new("printer").queue_level(1))?;
//! if lock.acquire(true).await? {
//!     // ...
//!     lock.release().await?;
//! }
//! ctx.shutdown().await?;
//! ```
pub mod codec;
mod config;
mod constants;
mod context;
mod errors;
pub mod feed;
pub mod lock;
pub mod schema;
pub mod store;
pub(crate) mod utils;

pub use config::*;
pub use constants::WILDCARD;
pub use context::*;
pub use errors::*;

#[cfg(test)]
mod context_test;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
