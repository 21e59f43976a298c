//! Agent system prompt.
//!
//! [`PromptContext::gather`] reads the local environment once; [`render`] is a
//! pure function of that snapshot and the registered tools.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::EnvConfig;
use crate::tools::ToolRegistry;

const MAX_CWD_ENTRIES: usize = 30;
const MAX_HISTORY_LINES: usize = 50;

const PROTOCOL: &str = concat!(
    "You are HALP Agent. You can decide to think and act using tools to help the user.\n",
    "When you need to act, emit ONLY a JSON object with keys 'tool' and 'input', e.g.\n",
    "{\"tool\": \"shell\", \"input\": \"ls -la\"}.\n",
    "Never include extra commentary around tool JSON. No code fences. No prose.\n",
    "After executing a tool, you will receive an 'Observation'. Use it to decide the next step.\n",
    "If you have a final answer for the user, emit ONLY {\"final\": \"...\"}. No extra text.\n",
);

const POLICY: &str = concat!(
    "Policy: NEVER use 'sudo' in any tool call. If elevated privileges are needed, do NOT call tools; ",
    "instead, emit ONLY a final answer that explains the exact sudo command the user can run manually.\n",
    "Policy: NEVER install or upgrade software in any tool call. Do not invoke package managers or installers ",
    "(e.g., apt, apt-get, yum, dnf, pacman, zypper, apk, brew, port) or language installers ",
    "(e.g., pip install, npm/yarn/pnpm, gem, cargo install, go install). Avoid shell-install patterns ",
    "(e.g., curl | bash, wget | sh). If installation appears required, do NOT call tools; instead, emit ONLY ",
    "a final answer describing the exact commands the user can run manually.\n",
    "Do not modify package repositories, version control state, or system configuration.\n",
    "If your previous reply had malformed tool JSON or a blocked command, re-emit a corrected tool JSON ",
    "or provide a final answer. Do not include anything besides the JSON object.\n",
    "Tool calls that execute CLI commands will be presented for user confirmation unless --unsafe_exec is set, ",
    "in which case they auto-execute.\n",
    "Avoid destructive commands. Prefer read-only queries unless explicitly requested.\n",
    "The user may also type 'yolo' as the first word of their prompt to enable auto-execution for this session. ",
    "The word 'yolo' is a directive and should be stripped from the task.\n",
);

/// Tail of the user's shell history file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellHistory {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

/// Snapshot of the environment the model is grounded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub os: String,
    pub arch: String,
    pub shell: String,
    pub user: String,
    pub home: String,
    pub cwd: String,
    /// `None` when the directory could not be listed.
    pub cwd_entries: Option<Vec<String>>,
    pub history: Option<ShellHistory>,
}

impl PromptContext {
    pub fn gather(env: &EnvConfig) -> Self {
        let home = dirs::home_dir();
        let cwd = env::current_dir().ok();

        let context = Self {
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            shell: env.shell.clone().unwrap_or_default(),
            user: env.user.clone().unwrap_or_else(|| "unknown".to_string()),
            home: home
                .as_deref()
                .map(|home| home.display().to_string())
                .unwrap_or_default(),
            cwd: cwd
                .as_deref()
                .map(|cwd| cwd.display().to_string())
                .unwrap_or_default(),
            cwd_entries: cwd.as_deref().and_then(list_directory),
            history: history_candidates(env.histfile.as_deref(), home.as_deref())
                .iter()
                .find_map(|path| read_history(path)),
        };

        debug!(
            entries = context.cwd_entries.as_ref().map(Vec::len),
            history = ?context.history.as_ref().map(|history| &history.path),
            "gathered prompt context"
        );
        context
    }
}

/// First [`MAX_CWD_ENTRIES`] names in sorted order, directories marked with `/`.
pub fn list_directory(dir: &Path) -> Option<Vec<String>> {
    let mut entries: Vec<(String, bool)> = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| {
            let is_dir = entry.path().is_dir();
            (entry.file_name().to_string_lossy().into_owned(), is_dir)
        })
        .collect();
    entries.sort();

    Some(
        entries
            .into_iter()
            .take(MAX_CWD_ENTRIES)
            .map(|(name, is_dir)| if is_dir { format!("{name}/") } else { name })
            .collect(),
    )
}

fn history_candidates(histfile: Option<&str>, home: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = histfile.map(PathBuf::from).into_iter().collect();
    if let Some(home) = home {
        candidates.push(home.join(".zsh_history"));
        candidates.push(home.join(".bash_history"));
    }
    candidates
}

/// Last [`MAX_HISTORY_LINES`] lines of `path`, if it is a readable file.
pub fn read_history(path: &Path) -> Option<ShellHistory> {
    if !path.is_file() {
        return None;
    }
    let bytes = fs::read(path).ok()?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(MAX_HISTORY_LINES);

    Some(ShellHistory {
        path: path.to_path_buf(),
        lines: lines[start..].iter().map(|line| line.to_string()).collect(),
    })
}

pub fn render(context: &PromptContext, tools: &ToolRegistry, verbose: bool) -> String {
    let mut prompt = String::new();
    prompt.push_str(PROTOCOL);
    prompt.push_str(POLICY);

    let _ = write!(
        prompt,
        "\nEnvironment:\nOS={} ({}), Shell={}, CWD={}\n",
        context.os, context.arch, context.shell, context.cwd
    );
    let _ = writeln!(prompt, "User: {} (home={})", context.user, context.home);

    let listing = match &context.cwd_entries {
        Some(entries) if entries.is_empty() => "<empty>".to_string(),
        Some(entries) => entries.join("  "),
        None => "<error listing directory>".to_string(),
    };
    let _ = write!(
        prompt,
        "\nCWD listing (first {MAX_CWD_ENTRIES} entries):\n{listing}\n"
    );

    match &context.history {
        Some(history) => {
            let block = if history.lines.is_empty() {
                "<no history available>".to_string()
            } else {
                history.lines.join("\n")
            };
            let _ = write!(
                prompt,
                "\nShell history (last {MAX_HISTORY_LINES} lines from {}):\n{block}\n",
                history.path.display()
            );
        }
        None => prompt.push_str("\nShell history: <none found>\n"),
    }

    prompt.push_str("\nTools available:\n");
    for tool in tools.iter() {
        let _ = writeln!(prompt, "- {}: {}", tool.name(), tool.description());
    }

    if !verbose {
        prompt.push_str("Be terse and concise.\n");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ShellTool;

    fn context() -> PromptContext {
        PromptContext {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            shell: "/bin/zsh".to_string(),
            user: "ada".to_string(),
            home: "/home/ada".to_string(),
            cwd: "/home/ada/src".to_string(),
            cwd_entries: Some(vec!["Cargo.toml".to_string(), "src/".to_string()]),
            history: None,
        }
    }

    #[test]
    fn render_includes_protocol_environment_and_tools() {
        let tools = ToolRegistry::with_shell(ShellTool::new());
        let prompt = render(&context(), &tools, false);

        assert!(prompt.starts_with("You are HALP Agent."));
        assert!(prompt.contains(r#"{"tool": "shell", "input": "ls -la"}"#));
        assert!(prompt.contains("OS=linux (x86_64), Shell=/bin/zsh, CWD=/home/ada/src\n"));
        assert!(prompt.contains("User: ada (home=/home/ada)\n"));
        assert!(prompt.contains("Cargo.toml  src/\n"));
        assert!(prompt.contains("Shell history: <none found>\n"));
        assert!(prompt.contains("- shell: Execute shell commands on the local system."));
        assert!(prompt.ends_with("Be terse and concise.\n"));
    }

    #[test]
    fn verbose_prompt_drops_terse_instruction() {
        let tools = ToolRegistry::with_shell(ShellTool::new());
        let prompt = render(&context(), &tools, true);
        assert!(!prompt.contains("Be terse and concise."));
    }

    #[test]
    fn empty_and_unreadable_directories_are_labelled() {
        let tools = ToolRegistry::builder().build();
        let mut context = context();

        context.cwd_entries = Some(Vec::new());
        assert!(render(&context, &tools, true).contains("<empty>"));

        context.cwd_entries = None;
        assert!(render(&context, &tools, true).contains("<error listing directory>"));
    }

    #[test]
    fn directory_listing_is_sorted_capped_and_marks_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("b_dir")).expect("mkdir");
        for index in 0..40 {
            fs::write(dir.path().join(format!("f{index:02}")), "").expect("write");
        }
        fs::write(dir.path().join("a_file"), "").expect("write");

        let entries = list_directory(dir.path()).expect("listing");
        assert_eq!(entries.len(), MAX_CWD_ENTRIES);
        assert_eq!(entries[0], "a_file");
        assert_eq!(entries[1], "b_dir/");
        assert_eq!(entries[2], "f00");
    }

    #[test]
    fn history_keeps_the_last_fifty_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".bash_history");
        let text: String = (0..60).map(|index| format!("cmd {index}\n")).collect();
        fs::write(&path, text).expect("write");

        let history = read_history(&path).expect("history");
        assert_eq!(history.lines.len(), MAX_HISTORY_LINES);
        assert_eq!(history.lines.first().map(String::as_str), Some("cmd 10"));
        assert_eq!(history.lines.last().map(String::as_str), Some("cmd 59"));
        assert!(read_history(&dir.path().join("missing")).is_none());

        let mut context = context();
        context.history = Some(history);
        let prompt = render(&context, &ToolRegistry::builder().build(), true);
        assert!(prompt.contains(&format!(
            "Shell history (last 50 lines from {}):\ncmd 10\n",
            path.display()
        )));
    }
}
