//! Shared infrastructure: telemetry and settings

pub mod settings;
pub mod telemetry;

pub use settings::{Settings, SettingsError};
pub use telemetry::init_tracing;
