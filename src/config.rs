//! Environment-driven configuration.
//!
//! Loaded once at startup; optional collaborator credentials degrade the
//! corresponding collaborator to a no-op without affecting the core.

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub nats_url: String,
    pub app_url: String,
    pub cors_origins: Vec<String>,
    pub environment: Environment,
    /// Shared secret for e-signature webhook HMAC verification. Mandatory
    /// outside development.
    pub webhook_shared_secret: Option<String>,
    pub signwell: Option<SignwellConfig>,
}

#[derive(Debug, Clone)]
pub struct SignwellConfig {
    pub base_url: String,
    pub api_key: String,
    pub template_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let environment = match std::env::var("ENVIRONMENT").as_deref() {
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        };

        let webhook_shared_secret = optional("WEBHOOK_SHARED_SECRET");
        if environment == Environment::Production && webhook_shared_secret.is_none() {
            return Err(Error::Validation(
                "WEBHOOK_SHARED_SECRET is required in production".into(),
            ));
        }

        // The e-signature client needs all three settings; with any of them
        // absent, NDA envelopes degrade to a logged no-op.
        let signwell = match (
            optional("SIGNWELL_BASE_URL"),
            optional("SIGNWELL_API_KEY"),
            optional("SIGNWELL_TEMPLATE_ID"),
        ) {
            (base_url, Some(api_key), Some(template_id)) => Some(SignwellConfig {
                base_url: base_url.unwrap_or_else(|| "https://www.signwell.com/api/v1".into()),
                api_key,
                template_id,
            }),
            _ => None,
        };

        Ok(Config {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            database_url: required("DATABASE_URL")?,
            nats_url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".into()),
            app_url: std::env::var("APP_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into()),
            cors_origins: optional("CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            environment,
            webhook_shared_secret,
            signwell,
        })
    }
}

fn required(key: &'static str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::Validation(format!("{key} is not set")))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
