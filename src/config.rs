use std::{env, io};

use tracing::debug;

const DEFAULT_API_BASE: &str = "https://api.postcodes.io";
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_WORKERS: usize = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CACHE_TTL_HOURS: u64 = 24;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base: String,
    pub batch_size: usize,
    pub workers: usize,
    pub request_timeout_secs: u64,
    pub cache_ttl_hours: u64,
    pub database_file_name: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            api_base: env::var("POSTCODES_API_BASE")
                .ok()
                .map(|v| v.trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            batch_size: parse_usize("GEOCODE_BATCH_SIZE", DEFAULT_BATCH_SIZE).clamp(1, 100),
            workers: parse_usize("GEOCODE_WORKERS", DEFAULT_WORKERS).max(1),
            request_timeout_secs: parse_u64(
                "GEOCODE_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )
            .max(1),
            cache_ttl_hours: parse_u64("CACHE_TTL_HOURS", DEFAULT_CACHE_TTL_HOURS),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "postcode-clusterer.db".to_string()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            cache_ttl_hours: DEFAULT_CACHE_TTL_HOURS,
            database_file_name: "postcode-clusterer.db".to_string(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
