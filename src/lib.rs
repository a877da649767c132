// Root module exports
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod logging;

// Re-export common items for convenience
pub use bluetooth::{BleEvent, BleManager, EventBroker, EventFilter, GattTransport, ManagerConfig};
pub use config::AppConfig;
pub use error::{AppError, GattError};
pub use logging::configure_logging;
