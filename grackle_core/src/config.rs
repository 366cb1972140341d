use serde::Deserialize;
use std::path::PathBuf;

/// How a Flags container treats children whose bit ranges overlap.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    /// Flags later in child order silently overwrite earlier bits.
    #[default]
    LastWriteWins,
    /// Overlapping writes are a configuration error.
    Reject,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FlagsSettings {
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ArraySettings {
    /// Upper bound on array expansion, guarding against a hostile or broken
    /// count driving unbounded cloning.
    #[serde(default = "default_max_expansion")]
    pub max_expansion: u32,
}

fn default_max_expansion() -> u32 {
    4096
}

impl Default for ArraySettings {
    fn default() -> Self {
        Self {
            max_expansion: default_max_expansion(),
        }
    }
}

/// Engine-wide policy knobs for a [`DataModel`](crate::model::DataModel).
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub flags: FlagsSettings,
    #[serde(default)]
    pub arrays: ArraySettings,
}

impl EngineConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
