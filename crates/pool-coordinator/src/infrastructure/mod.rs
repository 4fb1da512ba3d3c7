pub mod memory_backend;
