use std::{env, fmt::Display, str::FromStr};

use craftdock_runtime::RuntimeConfig;
use tracing::{info, warn};

/// Process configuration, all environment-driven with logged defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub database_url: String,
    /// Docker endpoint override; platform default when unset.
    pub docker_endpoint: Option<String>,
    pub image: String,
    pub game_port: u16,
    /// Per-owner memory budget reported and enforced by the control plane.
    pub memory_quota_mb: u32,
    pub stop_timeout_secs: i64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            http_port: try_load("CRAFTDOCK_PORT", "8080"),
            database_url: try_load("CRAFTDOCK_DATABASE_URL", "sqlite://craftdock.sqlite"),
            docker_endpoint: env::var("CRAFTDOCK_DOCKER_HOST").ok(),
            image: try_load("CRAFTDOCK_IMAGE", "itzg/minecraft-server"),
            game_port: try_load("CRAFTDOCK_GAME_PORT", "25565"),
            memory_quota_mb: try_load("CRAFTDOCK_MEMORY_QUOTA_MB", "2000"),
            stop_timeout_secs: try_load("CRAFTDOCK_STOP_TIMEOUT_SECS", "30"),
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            image: self.image.clone(),
            game_port: self.game_port,
            stop_timeout_secs: self.stop_timeout_secs,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            database_url: "sqlite://craftdock.sqlite".to_string(),
            docker_endpoint: None,
            image: "itzg/minecraft-server".to_string(),
            game_port: 25565,
            memory_quota_mb: 2000,
            stop_timeout_secs: 30,
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}
