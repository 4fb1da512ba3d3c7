//! Application module
//!
//! Service wiring, background tasks and lifecycle of the `serve` command.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
