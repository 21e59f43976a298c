//! Diagnostic logging to stderr.
//!
//! Stdout belongs to the conversation, so every tracing event goes to stderr.
//! `HALP_LOG` takes `EnvFilter` directives and wins over `--debug`.

use tracing_subscriber::EnvFilter;

use crate::config::EnvConfig;

const DEBUG_DIRECTIVES: &str = "halp=debug,agent_provider_openai=debug,chat_api=debug";
const QUIET_DIRECTIVES: &str = "error";

pub fn default_directives(debug: bool) -> &'static str {
    if debug {
        DEBUG_DIRECTIVES
    } else {
        QUIET_DIRECTIVES
    }
}

/// Builds the filter; unparsable `HALP_LOG` values fall back to the defaults.
pub fn build_filter(directives: Option<&str>, debug: bool) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives(debug)))
}

/// Installs the global subscriber. Returns false if one was already set.
pub fn init(env: &EnvConfig, debug: bool) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(env.log_filter.as_deref(), debug))
        .with_writer(std::io::stderr)
        .with_target(debug)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_enables_workspace_targets() {
        assert_eq!(default_directives(false), "error");
        assert!(default_directives(true).contains("chat_api=debug"));
    }

    #[test]
    fn explicit_directives_win() {
        let filter = build_filter(Some("halp=trace"), false);
        assert!(filter.to_string().contains("halp=trace"));
    }

    #[test]
    fn invalid_directives_fall_back() {
        let filter = build_filter(Some("halp=notalevel"), false);
        assert!(!filter.to_string().contains("notalevel"));
    }

    #[test]
    fn second_init_is_harmless() {
        let env = EnvConfig::default();
        let _ = init(&env, false);
        assert!(!init(&env, true));
    }
}
