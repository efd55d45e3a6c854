use std::env;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use log::{log, Level};

lazy_static! {
    pub static ref SECURITY_ENABLED: bool = env::var("CAMPUS_SECURITY_ENABLED")
        .map(|x| x.parse::<bool>().unwrap_or(true))
        .unwrap_or(true);
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub blob_endpoint: String,
    pub blob_token: Option<String>,
    pub jwks_url: Option<String>,
    pub token_audience: Option<String>,
}

fn optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            log!(Level::Debug, "{key} not set");
            None
        }
    }
}

fn required(key: &str) -> Result<String> {
    optional(key).ok_or_else(|| anyhow!("{key} not set"))
}

impl Config {
    /// Reads the environment, after loading `.env` if one is present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            blob_endpoint: required("CAMPUS_BLOB_ENDPOINT")?,
            blob_token: optional("CAMPUS_BLOB_TOKEN"),
            jwks_url: optional("CAMPUS_JWKS_URL"),
            token_audience: optional("CAMPUS_TOKEN_AUDIENCE"),
        })
    }
}
