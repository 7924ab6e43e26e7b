pub(crate) mod error;
pub(crate) use error::*;

pub(crate) mod events;
pub(crate) mod probe;
