//! Versioned schema templates.
//!
//! A template maps each storage-backed document family (a *scope*) to a
//! nested description of field names and leaf type tags. `$placeholder`
//! members mark levels whose children are runtime identifiers.
mod catalog;
mod template;
pub use catalog::*;
pub use template::*;
