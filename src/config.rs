//! Configuration: the `~/.halp.env` file, CLI overrides, and environment.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = ".halp.env";

const KEY_BASE_URL: &str = "BASE_URL";
const KEY_API_KEY: &str = "API_KEY";
const KEY_DEFAULT_MODEL: &str = "DEFAULT_MODEL";
const MASKED_SECRET: &str = "********";

/// Process environment read once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    /// `HALP_CONFIG`: replaces `~/.halp.env`.
    pub config_path: Option<String>,
    /// `HALP_BASE_URL`: setup wizard default.
    pub default_base_url: Option<String>,
    /// `HALP_DEFAULT_MODEL`: setup wizard default.
    pub default_model: Option<String>,
    /// `HALP_LOG`: tracing filter directives.
    pub log_filter: Option<String>,
    pub no_color: bool,
    pub shell: Option<String>,
    pub user: Option<String>,
    pub histfile: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: env_string_opt("HALP_CONFIG"),
            default_base_url: env_string_opt("HALP_BASE_URL"),
            default_model: env_string_opt("HALP_DEFAULT_MODEL"),
            log_filter: env_string_opt("HALP_LOG"),
            no_color: env_string_opt("NO_COLOR").is_some(),
            shell: env_string_opt("SHELL"),
            user: env_string_opt("USER").or_else(|| env_string_opt("LOGNAME")),
            histfile: env_string_opt("HISTFILE"),
        }
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the home directory; set HALP_CONFIG")]
    NoHomeDirectory,
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("setup aborted: {0}")]
    Setup(#[source] io::Error),
}

/// Resolved endpoint settings, passed explicitly into provider construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HalpConfig {
    #[serde(rename = "BASE_URL")]
    pub base_url: String,
    #[serde(rename = "API_KEY")]
    pub api_key: String,
    #[serde(rename = "DEFAULT_MODEL")]
    pub default_model: String,
}

impl HalpConfig {
    /// Applies every non-empty override.
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(base_url) = non_empty(&overrides.base_url) {
            self.base_url = base_url.to_string();
        }
        if let Some(api_key) = non_empty(&overrides.api_key) {
            self.api_key = api_key.to_string();
        }
        if let Some(model) = non_empty(&overrides.model) {
            self.default_model = model.to_string();
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        Some(self.api_key.as_str()).filter(|key| !key.is_empty())
    }

    /// Copy safe to print.
    pub fn masked(&self) -> Self {
        Self {
            api_key: if self.api_key.is_empty() {
                String::new()
            } else {
                MASKED_SECRET.to_string()
            },
            ..self.clone()
        }
    }

    fn to_env_file(&self) -> String {
        format!(
            "{KEY_BASE_URL}={}\n{KEY_API_KEY}={}\n{KEY_DEFAULT_MODEL}={}\n",
            self.base_url, self.api_key, self.default_model
        )
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        non_empty(&self.base_url).is_none()
            && non_empty(&self.api_key).is_none()
            && non_empty(&self.model).is_none()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.trim().is_empty())
}

/// Interactive input for the setup wizard.
pub trait SetupPrompter {
    fn ask(&mut self, label: &str) -> io::Result<String>;

    /// Reads without echoing.
    fn ask_secret(&mut self, label: &str) -> io::Result<String>;

    fn announce(&mut self, message: &str);
}

pub fn config_path(env: &EnvConfig) -> Result<PathBuf, ConfigError> {
    if let Some(path) = &env.config_path {
        return Ok(PathBuf::from(path));
    }

    dirs::home_dir()
        .map(|home| home.join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoHomeDirectory)
}

/// Parses `KEY=VALUE` lines. Comments, blank lines, and unknown keys are skipped.
pub fn parse_env(text: &str) -> HalpConfig {
    let mut config = HalpConfig::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        match key.trim() {
            KEY_BASE_URL => config.base_url = value,
            KEY_API_KEY => config.api_key = value,
            KEY_DEFAULT_MODEL => config.default_model = value,
            other => debug!(key = other, "ignoring unknown config key"),
        }
    }

    config
}

pub fn load(path: &Path) -> Result<HalpConfig, ConfigError> {
    fs::read_to_string(path)
        .map(|text| parse_env(&text))
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes the config file, readable only by its owner.
pub fn save(path: &Path, config: &HalpConfig) -> Result<(), ConfigError> {
    let write_error = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_error)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(write_error)?;
    file.write_all(config.to_env_file().as_bytes())
        .map_err(write_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(write_error)?;
    }

    Ok(())
}

/// Runs the setup wizard and writes its answers to `path`.
pub fn run_setup(
    path: &Path,
    env: &EnvConfig,
    prompter: &mut dyn SetupPrompter,
) -> Result<HalpConfig, ConfigError> {
    prompter.announce(&format!(
        "No configuration found. Let's set up {}",
        path.display()
    ));

    let default_base = env.default_base_url.clone().unwrap_or_default();
    let default_model = env.default_model.clone().unwrap_or_default();

    let base_url = prompter
        .ask(&format!("{KEY_BASE_URL} [{default_base}]: "))
        .map_err(ConfigError::Setup)?;
    let api_key = prompter
        .ask_secret(&format!(
            "{KEY_API_KEY} (input hidden, leave blank if not needed): "
        ))
        .map_err(ConfigError::Setup)?;
    let model = prompter
        .ask(&format!("{KEY_DEFAULT_MODEL} [{default_model}]: "))
        .map_err(ConfigError::Setup)?;

    let config = HalpConfig {
        base_url: or_default(base_url, default_base),
        api_key: api_key.trim().to_string(),
        default_model: or_default(model, default_model),
    };

    save(path, &config)?;
    prompter.announce(&format!("Wrote config to {}", path.display()));
    Ok(config)
}

fn or_default(answer: String, default: String) -> String {
    let answer = answer.trim();
    if answer.is_empty() {
        default
    } else {
        answer.to_string()
    }
}

/// Loads the config file, falling back to overrides or the setup wizard.
pub fn ensure_config(
    path: &Path,
    overrides: &Overrides,
    force_init: bool,
    env: &EnvConfig,
    prompter: &mut dyn SetupPrompter,
) -> Result<HalpConfig, ConfigError> {
    debug!(path = %path.display(), force_init, "resolving configuration");

    let mut config = if force_init {
        run_setup(path, env, prompter)?
    } else if path.exists() {
        load(path)?
    } else if !overrides.is_empty() {
        info!(
            path = %path.display(),
            "config file not found; using command-line overrides without creating it"
        );
        HalpConfig::default()
    } else {
        run_setup(path, env, prompter)?
    };

    config.apply(overrides);
    Ok(config)
}
