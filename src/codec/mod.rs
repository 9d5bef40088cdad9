//! Documents, flat keys and stored values.
mod document;
pub mod glob;
mod path_codec;
mod query;
mod value;
pub mod value_codec;

pub use document::*;
pub use path_codec::*;
pub use query::*;
pub use value::*;

#[cfg(test)]
mod value_codec_test;
