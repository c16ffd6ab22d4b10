//! Command-line interface for harvest.

mod commands;

pub use commands::{is_verbose, run};
