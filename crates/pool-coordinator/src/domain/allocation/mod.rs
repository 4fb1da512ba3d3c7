//! Host pool allocation core.
//!
//! Everything here talks to the virtual desktop service only through
//! [`backend::PoolBackend`].

pub mod backend;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod lock_registry;
pub mod name_sequencer;
pub mod stack_lifecycle;
pub mod token_manager;
pub mod types;

pub use coordinator::AllocationCoordinator;
pub use coordinator::RegistrationPolicy;
pub use error::AllocationError;
pub use lock_registry::PoolLockRegistry;
pub use name_sequencer::Suffix;
pub use stack_lifecycle::StackLifecycle;
pub use stack_lifecycle::StackNaming;
pub use stack_lifecycle::StackSettings;
pub use token_manager::RegistrationTokenManager;
pub use token_manager::TokenPolicy;
