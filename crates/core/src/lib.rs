pub mod config;
pub mod error;
pub mod event;
pub mod scheduler;

pub use error::EventBusError;
