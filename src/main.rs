use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agent_provider_openai::{OpenAiProvider, OpenAiProviderConfig};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, warn};

use halp::cli::Cli;
use halp::config::{self, ConfigError, EnvConfig, HalpConfig};
use halp::interrupt::InterruptGuard;
use halp::prompt::{self, PromptContext};
use halp::terminal::TerminalHost;
use halp::tools::{ShellTool, ToolRegistry};
use halp::{Agent, ExitStatus, PromptReply};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let env = EnvConfig::from_env();
    halp::logging::init(&env, cli.debug);

    match run(cli, env) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("Error: {error:#}");
            ExitCode::from(ExitStatus::StartupFailed.code())
        }
    }
}

fn run(cli: Cli, env: EnvConfig) -> Result<u8> {
    let cancel = Arc::new(AtomicBool::new(false));
    let mut host = TerminalHost::new(Arc::clone(&cancel), env.no_color);

    let path = config::config_path(&env)?;
    let config = match config::ensure_config(&path, &cli.overrides(), cli.init, &env, &mut host)
    {
        Ok(config) => config,
        Err(ConfigError::Setup(error)) if error.kind() == io::ErrorKind::Interrupted => {
            debug!("setup interrupted by user");
            return Ok(ExitStatus::Cancelled.code());
        }
        Err(error) => return Err(error.into()),
    };

    if cli.env {
        let rendered = serde_json::to_string_pretty(&config.masked())
            .context("failed to render configuration")?;
        println!("{rendered}");
        return Ok(0);
    }

    if cli.list_models {
        return list_models(&config, &host);
    }

    let given_prompt = match cli.prompt_text() {
        Some(prompt) => Some(prompt),
        None if !io::stdin().is_terminal() => Some(read_piped_prompt()?),
        None => None,
    };

    let (Some(base_url), Some(model)) = (
        non_empty(&config.base_url),
        non_empty(&config.default_model),
    ) else {
        host.error(
            "Error: BASE_URL and DEFAULT_MODEL are required. Set them in ~/.halp.env or via CLI overrides.",
        );
        return Ok(ExitStatus::Misconfigured.code());
    };

    let initial_prompt = match given_prompt {
        Some(prompt) => prompt,
        None => match host.ask_prompt() {
            PromptReply::Line(line) => line,
            PromptReply::End => String::new(),
            PromptReply::Interrupted => return Ok(ExitStatus::Cancelled.code()),
        },
    };
    if initial_prompt.trim().is_empty() {
        debug!("no prompt given; nothing to do");
        return Ok(ExitStatus::Success.code());
    }

    let provider = OpenAiProvider::new(provider_config(&config, base_url).with_model(model))
        .context("failed to create completion provider")?;
    debug!(endpoint = provider.endpoint(), model, "provider ready");

    let _interrupts = match InterruptGuard::install(Arc::clone(&cancel)) {
        Ok(guard) => Some(guard),
        Err(error) => {
            warn!(%error, "failed to install interrupt handler");
            None
        }
    };

    let tools = ToolRegistry::with_shell(
        ShellTool::new()
            .with_timeout(cli.tool_timeout())
            .with_cancel(Arc::clone(&cancel)),
    );
    let system_prompt = prompt::render(&PromptContext::gather(&env), &tools, cli.verbose);
    let options = cli.agent_options(model);

    let agent = Agent::new(Arc::new(provider), tools, Arc::clone(&cancel));
    let outcome = agent.run(&system_prompt, &initial_prompt, &options, &mut host);

    debug!(
        status = ?outcome.status,
        steps = outcome.steps,
        messages = outcome.conversation.len(),
        cancelled = cancel.load(Ordering::SeqCst),
        "session finished"
    );
    Ok(outcome.status.code())
}

fn list_models(config: &HalpConfig, host: &TerminalHost) -> Result<u8> {
    let Some(base_url) = non_empty(&config.base_url) else {
        host.error(
            "Error: BASE_URL is required to list models. Provide via ~/.halp.env or --base_url.",
        );
        return Ok(ExitStatus::Misconfigured.code());
    };

    let provider = OpenAiProvider::new(provider_config(config, base_url))
        .context("failed to create completion provider")?;

    match provider.list_models() {
        Ok(models) if !models.is_empty() => {
            for model in models {
                println!("{model}");
            }
            Ok(ExitStatus::Success.code())
        }
        Ok(_) => {
            host.error("No models found or request failed.");
            Ok(ExitStatus::TransportFailed.code())
        }
        Err(error) => {
            debug!(%error, "model listing failed");
            host.error("No models found or request failed.");
            Ok(ExitStatus::TransportFailed.code())
        }
    }
}

fn provider_config(config: &HalpConfig, base_url: &str) -> OpenAiProviderConfig {
    let provider = OpenAiProviderConfig::new(base_url)
        .with_user_agent(format!("halp/{}", env!("CARGO_PKG_VERSION")));
    match config.api_key() {
        Some(api_key) => provider.with_api_key(api_key),
        None => provider,
    }
}

fn read_piped_prompt() -> Result<String> {
    let mut prompt = String::new();
    io::stdin()
        .read_to_string(&mut prompt)
        .context("failed to read prompt from stdin")?;
    Ok(prompt.trim().to_string())
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}
