//! Configuration for lesson trainer.

use review_engine::{LessonConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_NAME: &str = "lesson-trainer";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Whose items are studied and imported.
    #[serde(default = "default_learner")]
    pub learner: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lesson: LessonConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    /// One of trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_learner() -> String { "default".to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            learner: default_learner(),
            scheduler: SchedulerConfig::default(),
            lesson: LessonConfig::default(),
            display: DisplayConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from the user config dir; anything missing or malformed falls back to defaults.
    pub fn load() -> Self {
        Self::config_path()
            .and_then(|p| Self::load_from(&p).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.scheduler.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(path) = Self::config_path() {
            self.save_to(&path)?;
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|d| d.config_dir().join("config.toml"))
    }

    pub fn db_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|d| d.data_dir().join("lessons.db"))
    }

    pub fn log_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|d| d.data_dir().join("lesson-trainer.log"))
    }

    pub fn log_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Show the reference answer after a failed attempt.
    #[serde(default = "default_true")]
    pub reveal_answer_on_failure: bool,
    #[serde(default = "default_true")]
    pub show_drill_hint: bool,
}

fn default_true() -> bool { true }

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            reveal_answer_on_failure: true,
            show_drill_hint: true,
        }
    }
}
