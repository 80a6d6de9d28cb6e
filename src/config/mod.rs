use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use toml::map::Entry;
use tracing::warn;

/// Aspect ratios outside this range are ignored in favour of the mode's own.
pub const MIN_ASPECT: f32 = 0.2;
pub const MAX_ASPECT: f32 = 6.0;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub display: DisplayConfig,
    pub aspect: AspectConfig,
    pub surface: SurfaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DisplayConfig {
    /// Display number to open. 0 is the main LCD/HDMI output.
    pub id: u32,
    /// Overrides the size reported by the display. 0 means ask the display.
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AspectConfig {
    /// Stretch to the full display instead of keeping any aspect ratio.
    pub ignore_ratio: bool,
    pub ratio: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default = "default_pages")]
    pub pages: usize,
    #[serde(default)]
    pub layer: i32,
    #[serde(default = "default_opacity")]
    pub opacity: u8,
    /// Keep a black surface behind the main one to hide the console.
    #[serde(default = "default_blank_console")]
    pub blank_console: bool,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            pages: default_pages(),
            layer: 0,
            opacity: default_opacity(),
            blank_console: default_blank_console(),
        }
    }
}

fn default_pages() -> usize {
    3
}

fn default_opacity() -> u8 {
    255
}

fn default_blank_console() -> bool {
    true
}

static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn with<R>(f: impl FnOnce(&Config) -> R) -> R {
        let config = CONFIG.get_or_init(Config::load);
        f(config)
    }

    /// Reads every config layer and the environment, without caching.
    pub fn load() -> Self {
        let mut merged =
            toml::Value::try_from(Self::default()).unwrap_or(toml::Value::Table(Default::default()));

        // Lowest priority first
        let candidates = [
            get_system_config_path(),
            get_user_config_path(),
            Some(PathBuf::from("pageflip.toml")).filter(|p| p.exists()),
        ];
        for path in candidates.into_iter().flatten() {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            match content.parse::<toml::Value>() {
                Ok(value) => {
                    merge_value(&mut merged, value);
                    tracing::info!("Loaded config from {}", path.display());
                }
                Err(err) => warn!("Failed to parse {}: {err}", path.display()),
            }
        }

        let mut config: Config = merged.try_into().unwrap_or_else(|err| {
            warn!("Falling back to default config due to invalid overrides: {err}");
            Self::default()
        });
        config.apply_env();
        config
    }

    /// Highest priority layer.
    fn apply_env(&mut self) {
        if let Some(width) = env_parse("PAGEFLIP_WIDTH") {
            self.display.width = width;
        }
        if let Some(height) = env_parse("PAGEFLIP_HEIGHT") {
            self.display.height = height;
        }
        if let Some(ratio) = env_parse("PAGEFLIP_RATIO") {
            self.aspect.ratio = Some(ratio);
        }
        if std::env::var_os("PAGEFLIP_IGNORE_RATIO").is_some() {
            self.aspect.ignore_ratio = true;
        }
    }

    /// Aspect ratio the main surface is scaled to for a `width`x`height`
    /// mode on a `display` sized output.
    pub fn aspect_for(&self, width: u32, height: u32, display: (u32, u32)) -> f32 {
        if self.aspect.ignore_ratio {
            return display.0 as f32 / display.1 as f32;
        }
        match self.aspect.ratio {
            Some(ratio) if (MIN_ASPECT..=MAX_ASPECT).contains(&ratio) => ratio,
            _ => width as f32 / height as f32,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring {key}={value:?}: not a valid value");
            None
        }
    }
}

fn merge_value(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_map), toml::Value::Table(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), override_value),
                    Entry::Vacant(entry) => {
                        entry.insert(override_value);
                    }
                }
            }
        }
        (base_value, override_value) => {
            *base_value = override_value;
        }
    }
}

fn get_system_config_path() -> Option<PathBuf> {
    let path = PathBuf::from("/etc/pageflip/config.toml");
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

fn get_user_config_path() -> Option<PathBuf> {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".config"))
        })?;

    let path = config_dir.join("pageflip").join("config.toml");
    if path.exists() {
        Some(path)
    } else {
        None
    }
}
