pub mod api;
pub mod audit;
pub mod check;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod redis;
pub mod server;

// Re-export commonly used types
pub use check::{CheckCoordinator, CheckRequest, CheckResponse, ProcessPath, Reason};
pub use config::AppConfig;
pub use errors::{QuotaError, Result};
pub use server::{start_server, AppState, ServerConfig};
