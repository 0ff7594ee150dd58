//! # Engine configuration
//! Every tunable of the engine lives here, grouped by subsystem. All sections are
//! `#[serde(default)]`, so a partial (or empty) document deserializes to the defaults.

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("tile size {0} is not a power of two between 8 and 1024")]
    TileSize(u32),
    #[error("level of detail {0} is above the maximum of {max}", max = StrokeConfig::MAX_LOD)]
    LodLevel(u32),
    #[error("swap cold window must be nonzero")]
    ColdWindow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CodecKind {
    /// Bytes stored as-is.
    Raw,
    /// Channel-planar run length encoding.
    #[default]
    Rle,
}

#[derive(Clone, Debug, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tiles: TileConfig,
    pub swap: SwapConfig,
    pub scheduler: SchedulerConfig,
    pub strokes: StrokeConfig,
}
impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.tiles.tile_size;
        if !TileConfig::is_valid_size(size) {
            return Err(ConfigError::TileSize(size));
        }
        if self.strokes.lod_level > StrokeConfig::MAX_LOD {
            return Err(ConfigError::LodLevel(self.strokes.lod_level));
        }
        if self.swap.enabled && self.swap.cold_window == 0 {
            return Err(ConfigError::ColdWindow);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Edge length of a square tile, in pixels.
    pub tile_size: u32,
}
impl Default for TileConfig {
    fn default() -> Self {
        Self { tile_size: 64 }
    }
}
impl TileConfig {
    /// Edge lengths a tile may have. Only powers of two within are valid.
    pub const SIZES: std::ops::RangeInclusive<u32> = 8..=1024;
    #[must_use]
    pub fn is_valid_size(size: u32) -> bool {
        size.is_power_of_two() && Self::SIZES.contains(&size)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    pub enabled: bool,
    /// Tiles untouched for this many store accesses are swapped out when the scheduler idles.
    pub cold_window: u64,
    /// Where the swap file is created. Defaults to the user cache directory.
    pub directory: Option<std::path::PathBuf>,
    pub codec: CodecKind,
}
impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cold_window: 4096,
            directory: None,
            codec: CodecKind::default(),
        }
    }
}
impl SwapConfig {
    /// Configured directory, else `<cache dir>/impasto`, else the system temp dir.
    #[must_use]
    pub fn resolve_directory(&self) -> std::path::PathBuf {
        self.directory
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("impasto")))
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size. Zero picks the available parallelism.
    pub worker_threads: usize,
}
impl SchedulerConfig {
    #[must_use]
    pub fn resolve_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StrokeConfig {
    /// Minimum time between two canvas updates of an interactive move.
    pub update_interval_ms: u64,
    /// Preview level of detail. Zero disables LOD clones.
    pub lod_level: u32,
}
impl StrokeConfig {
    pub const MAX_LOD: u32 = 8;
    #[must_use]
    pub fn update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.update_interval_ms)
    }
}
impl Default for StrokeConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 30,
            lod_level: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }
    #[test]
    fn bad_tile_size() {
        let mut config = EngineConfig::default();
        config.tiles.tile_size = 48;
        assert!(matches!(config.validate(), Err(ConfigError::TileSize(48))));
    }
    #[test]
    fn lod_bound() {
        let mut config = EngineConfig::default();
        config.strokes.lod_level = StrokeConfig::MAX_LOD + 1;
        assert!(matches!(config.validate(), Err(ConfigError::LodLevel(_))));
    }
    #[test]
    fn explicit_directory_wins() {
        let swap = SwapConfig {
            directory: Some("/tmp/somewhere".into()),
            ..Default::default()
        };
        assert_eq!(swap.resolve_directory(), std::path::PathBuf::from("/tmp/somewhere"));
    }
}
