//! # Supervise
//!
//! Pipeline orchestration and the commands driving it.

pub(crate) mod cli;
pub(crate) use cli::*;

pub(crate) mod supervisor;
pub(crate) use supervisor::*;
