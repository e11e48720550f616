//! Shared helpers for the admin binary and broker connections.

pub mod bootstrap;
pub mod retry;
