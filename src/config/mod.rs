/// Billing settings loaded from config.toml
pub mod billing;

/// Database configuration and connection management
pub mod database;
