//! Per-session tasks: one reads, one writes, one runs the health check.

pub(crate) mod health;
pub(crate) mod read;
pub(crate) mod write;
