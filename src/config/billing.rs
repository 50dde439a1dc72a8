//! Billing configuration loading from config.toml
//!
//! The `[billing]` table controls the currency used when neither the package
//! nor the student carries one, and how payment tokens and public payment
//! URLs are built. Every key is optional.

use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Configuration structure representing the entire config.toml file
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Billing settings
    #[serde(default)]
    pub billing: BillingSettings,
}

/// Settings consumed by the billing accumulator
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    /// Currency used when neither package nor student specifies one
    pub default_currency: String,
    /// Fixed prefix of every payment token
    pub payment_token_prefix: String,
    /// Base URL of the public payment page
    pub payment_base_url: String,
    /// How many random tokens to try before giving up on uniqueness
    pub token_attempts: u32,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            default_currency: "USD".to_string(),
            payment_token_prefix: "PAY".to_string(),
            payment_base_url: "http://localhost:8000".to_string(),
            token_attempts: 10,
        }
    }
}

/// Loads the configuration from a TOML file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
        message: format!("Failed to read config file: {e}"),
    })?;

    toml::from_str(&contents).map_err(|e| Error::Config {
        message: format!("Failed to parse config.toml: {e}"),
    })
}

/// Loads the configuration from the default location (./config.toml), using
/// built-in defaults when the file does not exist.
pub fn load_default_config() -> Result<Config> {
    let path = Path::new("config.toml");
    if !path.exists() {
        tracing::debug!("No config.toml found, using default billing settings");
        return Ok(Config::default());
    }
    load_config(path)
}
