pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use config::AgentConfig;
pub use errors::{AgentError, AgentResult};
pub use services::coordinator::{CoordinatorHandle, RideCoordinator};
pub use state::{AppState, PlatformServices};
