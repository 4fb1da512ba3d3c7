//! Host pool allocation and lifecycle coordination for personal virtual
//! desktops.
//!
//! The [`domain::allocation`] module holds the coordinator and its parts,
//! [`api`] exposes it over HTTP and [`app`] wires both into the `serve`
//! command.

pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use domain::allocation;
