//! Layered TOML configuration with a `Default` impl for every field, so an absent or partial
//! config file still produces a runnable server (§4.12). Grounded on the `serdeconv`-backed
//! `GameConfig::load` pattern used by the game-side config, lifted into the core crate so both
//! the networking substrate and the application share one loader.
use flux::crypto;
use flux::logging::LoggingConfig;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub udp_port: u16,
    pub worker_thread_count: usize,
    pub task_worker_count: usize,
    pub db_worker_count: usize,
    pub rate_limit: u32,
    pub rate_burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 9000,
            udp_port: 9001,
            worker_thread_count: 4,
            task_worker_count: 4,
            db_worker_count: 2,
            rate_limit: 200,
            rate_burst: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// One of `none`, `xor`, `aes` — see `flux::crypto::build_adapter`.
    pub kind: String,
    pub key: String,
    pub iv: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            kind: "none".to_string(),
            key: String::new(),
            iv: String::new(),
        }
    }
}

impl EncryptionConfig {
    pub fn build_adapter(&self) -> Box<dyn crypto::EncryptionAdapter> {
        crypto::build_adapter(&self.kind, self.key.as_bytes(), self.iv.as_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub address: String,
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            address: "data/server.sqlite3".to_string(),
            pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub tick_interval_ms: u64,
    pub cell_size: f32,
    pub max_monsters: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        RoomConfig {
            tick_interval_ms: 40,
            cell_size: 4.0,
            max_monsters: 500,
        }
    }
}

/// Top-level configuration loaded from a single TOML file at startup (§4.12, §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub encryption: EncryptionConfig,
    pub database: DatabaseConfig,
    pub room: RoomConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads and merges a TOML file at `path` over the defaults above; a missing or partially
    /// specified file still produces a runnable configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> flux::error::CoreResult<Config> {
        serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| flux::error::CoreError::HandlerFailure(err.to_string()))
    }

    pub fn to_toml_string(&self) -> flux::error::CoreResult<String> {
        serdeconv::to_toml_string(self)
            .map_err(|err| flux::error::CoreError::HandlerFailure(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let toml = config.to_toml_string().unwrap();
        assert!(toml.contains("port"));
    }

    #[test]
    fn encryption_kind_builds_a_working_adapter() {
        let config = EncryptionConfig::default();
        let adapter = config.build_adapter();
        let mut buf = b"payload".to_vec();
        adapter.encrypt(&mut buf, 1);
        assert_eq!(buf, b"payload");
    }
}
