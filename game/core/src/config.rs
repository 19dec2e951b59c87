//! Game-specific configuration layered on top of the substrate's own `aetherium::Config`: the
//! wave spawn schedule is the only section the reference gameplay loop needs beyond what
//! `RoomConfig` (tick interval, cell size, monster cap) already covers (§4.12).
use aetherium::prelude::Config as CoreConfig;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveEntry {
    /// Server tick at which this wave spawns.
    pub at_tick: u64,
    pub count: usize,
}

impl Default for WaveEntry {
    fn default() -> Self {
        WaveEntry { at_tick: 0, count: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveScheduleConfig {
    /// Seeds the wave spawner's RNG; fixing this is what makes a tick trace reproducible.
    pub seed: u64,
    pub entries: Vec<WaveEntry>,
}

impl Default for WaveScheduleConfig {
    fn default() -> Self {
        WaveScheduleConfig {
            seed: 0xDEAD_BEEF,
            entries: vec![
                WaveEntry { at_tick: 25, count: 5 },
                WaveEntry { at_tick: 125, count: 10 },
                WaveEntry { at_tick: 250, count: 20 },
                WaveEntry { at_tick: 500, count: 30 },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GameConfig {
    #[serde(flatten)]
    pub core: CoreConfig,
    pub waves: WaveScheduleConfig,
}

impl GameConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> flux::error::CoreResult<GameConfig> {
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
        let config = GameConfig::default();
        let toml = config.to_toml_string().unwrap();
        assert!(toml.contains("tick_interval_ms"));
        assert!(toml.contains("seed"));
    }
}
