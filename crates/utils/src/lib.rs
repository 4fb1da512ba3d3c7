//! Shared helpers for the pool coordinator binaries: logging bootstrap and
//! build version information.

pub mod logging;
pub mod version;
