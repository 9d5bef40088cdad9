//! Change notifications decoded into documents.
mod change_feed;
mod event;

pub use change_feed::*;
pub use event::*;

#[cfg(test)]
mod change_feed_test;
