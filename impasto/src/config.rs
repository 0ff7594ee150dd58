use impasto_core::config::EngineConfig;

const DOCUMENTATION: &str = r#"# Impasto settings. You may edit this file, but be aware that formatting and comments will not
# be preserved when it is rewritten. Missing keys take their default values.

# [engine.tiles]     tile_size: edge of a square tile in pixels, a power of two from 8 to 1024.
# [engine.swap]      enabled, cold_window (store accesses before a tile counts as cold),
#                    directory (defaults to the user cache dir), codec ("raw" or "rle").
# [engine.scheduler] worker_threads: 0 uses every available core.
# [engine.strokes]   update_interval_ms: minimum time between canvas updates while moving,
#                    lod_level: preview level of detail, 0 disables previews.
# [demo]             canvas_size in pixels, output: directory for the saved layer.

"#;

#[derive(Clone, Debug, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub demo: DemoSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    pub canvas_size: u32,
    /// Where the saved layer goes. Defaults to the system temp dir.
    pub output: Option<std::path::PathBuf>,
}
impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            canvas_size: 256,
            output: None,
        }
    }
}

#[must_use]
pub fn preferences_dir() -> Option<std::path::PathBuf> {
    let mut base_dir = dirs::preference_dir()?;
    base_dir.push(env!("CARGO_PKG_NAME"));
    Some(base_dir)
}

impl Settings {
    const FILENAME: &'static str = "settings.toml";

    /// Load from `path`, or from the preferences dir if `None`. A missing preferences file is
    /// created with the defaults.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let Some(mut path) = preferences_dir() else {
            log::warn!("no preferences dir, using default settings");
            return Ok(Self::default());
        };
        path.push(Self::FILENAME);
        if path.exists() {
            return Self::from_file(&path);
        }
        let settings = Self::default();
        if let Err(err) = settings.save(&path) {
            log::warn!("couldn't write default settings to {}: {err:#}", path.display());
        }
        Ok(settings)
    }
    fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let string = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&string)?;
        settings.engine.validate()?;
        log::info!("loaded settings from {}", path.display());
        Ok(settings)
    }
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            // Ignore errors (could already exist). Real errors surface on write.
            let _ = std::fs::DirBuilder::new().create(parent);
        }
        let mut string = toml::ser::to_string_pretty(self)?;
        // Prefix some documentation.
        string = DOCUMENTATION.to_owned() + &string;
        std::fs::write(path, string)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn documented_defaults_parse() {
        let string = DOCUMENTATION.to_owned() + &toml::ser::to_string_pretty(&Settings::default()).unwrap();
        let parsed: Settings = toml::from_str(&string).unwrap();
        assert_eq!(parsed, Settings::default());
    }
    #[test]
    fn partial_file_fills_defaults() {
        let parsed: Settings = toml::from_str("[engine.strokes]\nlod_level = 2\n").unwrap();
        assert_eq!(parsed.engine.strokes.lod_level, 2);
        assert_eq!(parsed.engine.tiles.tile_size, 64);
        assert_eq!(parsed.demo.canvas_size, 256);
    }
}
