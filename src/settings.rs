use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::classification::OpenAiConfig;
use crate::scheduler::{default_rollup_grace, ScheduleConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key. The key itself is never
    /// written to the settings file.
    pub api_key_env: String,
    pub image_detail: String,
    pub timeout_secs: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-5-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            image_detail: "low".into(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub capture_interval_secs: u64,
    /// Screenshot program and its arguments; it must write one image to stdout.
    pub capture_command: Vec<String>,
    pub capture_timeout_secs: u64,
    pub classifier: ClassifierSettings,
    /// Defaults to the classification timeout plus five seconds.
    pub rollup_grace_secs: Option<u64>,
    pub max_backfill_hours: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("focuslog.db"),
            capture_interval_secs: 15,
            capture_command: vec!["grim".into(), "-".into()],
            capture_timeout_secs: 10,
            classifier: ClassifierSettings::default(),
            rollup_grace_secs: None,
            max_backfill_hours: 24,
            shutdown_grace_secs: 10,
        }
    }
}

impl Settings {
    /// Reads settings from `path`. A missing file gives the defaults, as do
    /// fields missing from the file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }

    pub fn schedule(&self) -> Result<ScheduleConfig> {
        let classification_timeout = Duration::from_secs(self.classifier.timeout_secs);
        let config = ScheduleConfig {
            capture_interval: Duration::from_secs(self.capture_interval_secs),
            capture_timeout: Duration::from_secs(self.capture_timeout_secs),
            classification_timeout,
            rollup_grace: self
                .rollup_grace_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| default_rollup_grace(classification_timeout)),
            max_backfill: Duration::from_secs(self.max_backfill_hours * 60 * 60),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ..ScheduleConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Classifier configuration with the API key read from the environment
    /// (after `.env` has been loaded).
    pub fn openai(&self) -> Result<OpenAiConfig> {
        let env = &self.classifier.api_key_env;
        let api_key = std::env::var(env)
            .with_context(|| format!("Required environment variable '{env}' is not set"))?;
        if api_key.trim().is_empty() {
            bail!("environment variable '{env}' is empty");
        }
        Ok(OpenAiConfig {
            endpoint: self.classifier.endpoint.clone(),
            api_key,
            model: self.classifier.model.clone(),
            image_detail: self.classifier.image_detail.clone(),
            request_timeout: Duration::from_secs(self.classifier.timeout_secs),
        })
    }
}
