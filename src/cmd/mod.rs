//! Command-line entry points.

pub mod extract;
