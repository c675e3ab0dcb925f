// Re-export modules for the binary and integration tests
pub mod config;
pub mod models;
pub mod sync; // Client-side synchronization layer

// Re-export main types for convenience
pub use config::SyncConfig;
pub use models::*;
pub use sync::{ConversationSession, ConversationStore, MemoryBackend, SyncError};
