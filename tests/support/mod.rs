#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use agent_provider::CancelSignal;
use agent_provider_mock::{ScriptedProvider, ScriptedReply};
use halp::tools::{CommandOutput, CommandRunner, RunLimits, ShellTool};
use halp::{Agent, AgentHost, AgentOptions, AgentRun, Confirmation, Notice, PromptReply, ToolRegistry};

pub const SYSTEM_PROMPT: &str = "You are a test agent.";

/// Everything the agent showed or asked, in order.
#[derive(Debug, Default)]
pub struct HostTrace {
    pub fragments: Vec<String>,
    pub replies: usize,
    pub finals: Vec<String>,
    pub notices: Vec<Notice>,
    pub confirmations: Vec<(String, String)>,
    pub prompts_requested: usize,
}

impl HostTrace {
    pub fn streamed_text(&self) -> String {
        self.fragments.concat()
    }

    pub fn observations(&self) -> Vec<&halp::ToolResult> {
        self.notices
            .iter()
            .filter_map(|notice| match notice {
                Notice::Observation { result, .. } => Some(result),
                _ => None,
            })
            .collect()
    }
}

/// Host with scripted answers to confirmations and follow-up prompts.
#[derive(Default)]
pub struct RecordingHost {
    pub trace: HostTrace,
    confirmations: VecDeque<Confirmation>,
    prompts: VecDeque<PromptReply>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_confirmations(mut self, answers: impl IntoIterator<Item = Confirmation>) -> Self {
        self.confirmations.extend(answers);
        self
    }

    pub fn with_prompts(mut self, replies: impl IntoIterator<Item = PromptReply>) -> Self {
        self.prompts.extend(replies);
        self
    }
}

impl AgentHost for RecordingHost {
    fn write_fragment(&mut self, fragment: &str) {
        self.trace.fragments.push(fragment.to_string());
    }

    fn end_reply(&mut self) {
        self.trace.replies += 1;
    }

    fn show_final(&mut self, text: &str) {
        self.trace.finals.push(text.to_string());
    }

    fn notify(&mut self, notice: Notice) {
        self.trace.notices.push(notice);
    }

    fn confirm(&mut self, tool: &str, command: &str) -> Confirmation {
        self.trace
            .confirmations
            .push((tool.to_string(), command.to_string()));
        self.confirmations
            .pop_front()
            .unwrap_or(Confirmation::Unavailable)
    }

    fn next_prompt(&mut self) -> PromptReply {
        self.trace.prompts_requested += 1;
        self.prompts.pop_front().unwrap_or(PromptReply::End)
    }
}

/// Runner that records commands instead of spawning processes.
#[derive(Default)]
pub struct SpawnCountingRunner {
    commands: Mutex<Vec<String>>,
}

impl SpawnCountingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn_count(&self) -> usize {
        lock_unpoisoned(&self.commands).len()
    }

    pub fn commands(&self) -> Vec<String> {
        lock_unpoisoned(&self.commands).clone()
    }
}

impl CommandRunner for SpawnCountingRunner {
    fn run(
        &self,
        command: &str,
        _limits: RunLimits,
        _cancel: Option<&CancelSignal>,
    ) -> Result<CommandOutput, String> {
        lock_unpoisoned(&self.commands).push(command.to_string());
        Ok(CommandOutput {
            status: Some(0),
            stdout: format!("ran: {command}\n").into_bytes(),
            ..CommandOutput::default()
        })
    }
}

pub struct Harness {
    pub provider: Arc<ScriptedProvider>,
    pub runner: Arc<SpawnCountingRunner>,
    pub cancel: CancelSignal,
    pub agent: Agent,
}

impl Harness {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self::with_provider(ScriptedProvider::new(replies))
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_provider(ScriptedProvider::from_texts(texts))
    }

    pub fn with_provider(provider: ScriptedProvider) -> Self {
        let provider = Arc::new(provider);
        let runner = SpawnCountingRunner::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let tools = ToolRegistry::with_shell(
            ShellTool::with_runner(runner.clone()).with_cancel(Arc::clone(&cancel)),
        );
        let agent = Agent::new(provider.clone(), tools, Arc::clone(&cancel));

        Self {
            provider,
            runner,
            cancel,
            agent,
        }
    }

    pub fn run(&self, prompt: &str, options: &AgentOptions, host: &mut RecordingHost) -> AgentRun {
        self.agent.run(SYSTEM_PROMPT, prompt, options, host)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Options for a single-turn session.
pub fn single_turn() -> AgentOptions {
    AgentOptions::new("test-model").with_continue_conversation(false)
}

pub fn tool_call(command: &str) -> String {
    serde_json::json!({ "tool": "shell", "input": command }).to_string()
}

pub fn final_answer(text: &str) -> String {
    serde_json::json!({ "final": text }).to_string()
}

/// Parses the JSON payload of an `Observation:` user message.
pub fn observation_payload(content: &str) -> serde_json::Value {
    let payload = content
        .strip_prefix(halp::agent::OBSERVATION_PREFIX)
        .unwrap_or_else(|| panic!("not an observation: {content}"));
    serde_json::from_str(payload).expect("observation is JSON")
}

pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
