//! Command-line surface.

use std::time::Duration;

use clap::Parser;

use crate::agent::{AgentOptions, DEFAULT_MAX_STEPS};
use crate::config::Overrides;

const ABOUT: &str = "halp - AI assistance for the command line.

Configuration lives in ~/.halp.env (or $HALP_CONFIG) with the keys:
- BASE_URL: OpenAI-compatible base URL (e.g., https://api.openai.com)
- API_KEY: API key for the provider
- DEFAULT_MODEL: Default model to use

Flags override these at runtime. Start a prompt with `yolo` to auto-execute
shell commands for the session.";

#[derive(Debug, Parser)]
#[command(
    name = "halp",
    version,
    about = "AI assistance for the command line",
    long_about = ABOUT,
    disable_version_flag = true
)]
pub struct Cli {
    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    _version: Option<bool>,

    /// Print the loaded configuration (API key masked) and exit
    #[arg(long)]
    pub env: bool,

    /// Use a normal, not-terse assistant system prompt
    #[arg(long)]
    pub verbose: bool,

    /// Enable debug logging to stderr
    #[arg(short, long)]
    pub debug: bool,

    /// Run the interactive setup wizard, even if the config file exists
    #[arg(long)]
    pub init: bool,

    /// Run a single agent episode and exit after the final reply
    #[arg(short, long)]
    pub quick: bool,

    /// Override BASE_URL
    #[arg(short = 'u', long = "base_url")]
    pub base_url: Option<String>,

    /// Override API_KEY
    #[arg(short = 'k', long = "api_key")]
    pub api_key: Option<String>,

    /// Model to use (overrides DEFAULT_MODEL)
    #[arg(short, long)]
    pub model: Option<String>,

    /// List available models via /v1/models
    #[arg(short, long = "list_models")]
    pub list_models: bool,

    /// Max agent steps per user turn
    #[arg(long = "max_steps", default_value_t = DEFAULT_MAX_STEPS, value_parser = parse_max_steps)]
    pub max_steps: usize,

    /// Auto-execute shell commands without confirmation (DANGEROUS)
    #[arg(long = "unsafe_exec")]
    pub unsafe_exec: bool,

    /// Never run commands; report what would have been executed
    #[arg(long = "dry_run")]
    pub dry_run: bool,

    /// Seconds before a shell command is killed
    #[arg(long = "tool_timeout", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub tool_timeout: u64,

    /// Prompt to send to the model (use quotes)
    pub prompt: Vec<String>,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
        }
    }

    /// Prompt words joined, or `None` when none were given.
    pub fn prompt_text(&self) -> Option<String> {
        if self.prompt.is_empty() {
            None
        } else {
            Some(self.prompt.join(" ").trim().to_string())
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout)
    }

    pub fn agent_options(&self, model: &str) -> AgentOptions {
        AgentOptions::new(model)
            .with_max_steps(self.max_steps)
            .with_dry_run(self.dry_run)
            .with_unsafe_exec(self.unsafe_exec)
            .with_continue_conversation(!self.quick)
    }
}

fn parse_max_steps(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(steps) => Ok(steps),
        Err(error) => Err(error.to_string()),
    }
}
