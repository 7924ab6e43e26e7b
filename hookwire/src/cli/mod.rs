//! # Cli
//!
//! Command line interface: main options and sub-command dispatch.

#[allow(clippy::module_inception)]
pub(crate) mod cli;
pub(crate) use cli::*;
