pub mod dapr_state_store;
pub mod in_memory_state_store;

// Re-export both state store backends
pub use dapr_state_store::DaprStateStore;
pub use in_memory_state_store::InMemoryStateStore;
