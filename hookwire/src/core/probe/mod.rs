//! # Probes
//!
//! Probe descriptors, their attachment lifecycle and the host registries
//! actually installing them.

pub(crate) mod descriptor;
pub(crate) use descriptor::*;

pub(crate) mod manager;
pub(crate) use manager::*;

pub(crate) mod registry;
pub(crate) use registry::*;

pub(crate) mod simulated;

#[cfg(feature = "bpf")]
pub(crate) mod bpf;

#[cfg(test)]
pub(crate) mod testing;
