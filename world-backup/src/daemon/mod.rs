//! Long-running service support.

pub mod shutdown;
