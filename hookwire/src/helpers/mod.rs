pub(crate) mod logger;
pub(crate) mod pidfile;
pub(crate) mod ratelimit;
pub(crate) mod signals;
pub(crate) mod time;
