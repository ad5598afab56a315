//! Core domain types, errors, and constants for `isorun`.
//!
//! ## Key Components
//!
//! - **`errors`**: the agent `Error` enum and `Result` alias. Task failures are
//!   not errors; they are carried by [`result::Outcome`].
//! - **`types`**: environment wrapper, tree materialization modes, package pins
//!   and output references.
//! - **`result`**: the tagged execution outcome, statistics and the flat record
//!   persisted to the result file.
//! - **`constants`**: command line markers, directory tokens and environment
//!   variable names.

pub mod constants;
pub mod errors;
pub mod result;
pub mod types;

pub use self::{
    constants::*,
    errors::{Error, Result, ResultExt},
    result::*,
    types::*,
};
