//! Shared helpers for the service binary and background tasks.

pub mod backoff;
pub mod bootstrap;
pub mod periodic;
