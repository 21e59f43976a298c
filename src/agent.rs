//! The guarded ReACT loop.
//!
//! One [`Agent::run`] call owns a conversation and walks it through explicit
//! states: ask the model, parse the reply, optionally confirm with the user,
//! execute the tool, and feed the observation back. Everything that touches
//! the terminal goes through [`AgentHost`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use agent_provider::{
    CancelSignal, ChatMessage, CompletionProvider, CompletionRequest, TransportError,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::directive::{self, Directive, ExtractionFailure};
use crate::safety::{PolicyFlags, SafetyDecision, SafetyPolicy};
use crate::stream::{CompletionStream, StreamTermination};
use crate::tools::{Capability, ToolRegistry, ToolResult};

/// First prompt word that switches the session to auto-exec.
pub const AUTO_EXEC_DIRECTIVE: &str = "yolo";
pub const DEFAULT_MAX_STEPS: usize = 10;
pub const OBSERVATION_PREFIX: &str = "Observation:\n";
pub const MALFORMED_DIRECTIVE_ERROR: &str = "Malformed tool JSON. Emit ONLY a JSON object like {\"tool\": \"shell\", \"input\": \"...\"} or a final {\"final\": \"...\"}. No extra text.";
pub const REFUSED_BY_USER: &str = "refused by user";

const EXIT_COMMANDS: [&str; 3] = ["/exit", "/quit", "/q"];

/// Per-session knobs resolved from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    pub model: String,
    pub max_steps: usize,
    pub auto_exec: bool,
    pub dry_run: bool,
    pub unsafe_exec: bool,
    /// Ask for another user turn after each final answer.
    pub continue_conversation: bool,
}

impl AgentOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_steps: DEFAULT_MAX_STEPS,
            auto_exec: false,
            dry_run: false,
            unsafe_exec: false,
            continue_conversation: true,
        }
    }

    /// Sets the step budget; zero is raised to one.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_auto_exec(mut self, auto_exec: bool) -> Self {
        self.auto_exec = auto_exec;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_unsafe_exec(mut self, unsafe_exec: bool) -> Self {
        self.unsafe_exec = unsafe_exec;
        self
    }

    pub fn with_continue_conversation(mut self, continue_conversation: bool) -> Self {
        self.continue_conversation = continue_conversation;
        self
    }
}

/// How a session ended. Each variant maps to a distinct process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    TransportFailed,
    /// No base URL or model to talk to.
    Misconfigured,
    StepsExhausted,
    /// The session never started: unreadable config, no home directory, and the like.
    StartupFailed,
    Cancelled,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::TransportFailed => 1,
            Self::Misconfigured => 2,
            Self::StepsExhausted => 3,
            Self::StartupFailed => 4,
            Self::Cancelled => 130,
        }
    }
}

/// Something the user should see that is not streamed model text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    AutoExecEnabled,
    ToolCall {
        tool: String,
        input: String,
        decision: SafetyDecision,
    },
    Refused {
        command: String,
        reason: String,
    },
    Malformed(ExtractionFailure),
    UnknownTool {
        name: String,
        error: String,
    },
    Observation {
        tool: String,
        result: ToolResult,
    },
    TransportFailed(TransportError),
    StepsExhausted {
        max_steps: usize,
    },
    Cancelled,
}

/// Answer to an interactive confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Approved,
    Declined,
    /// No interactive input exists. Never treated as approval.
    Unavailable,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptReply {
    Line(String),
    End,
    Interrupted,
}

/// Terminal boundary of the loop.
pub trait AgentHost {
    /// Streams one fragment of assistant text as it arrives.
    fn write_fragment(&mut self, fragment: &str);

    /// Called once the current assistant reply is fully received.
    fn end_reply(&mut self);

    fn show_final(&mut self, text: &str);

    fn notify(&mut self, notice: Notice);

    fn confirm(&mut self, tool: &str, command: &str) -> Confirmation;

    /// Asks for a follow-up user turn after a final answer.
    fn next_prompt(&mut self) -> PromptReply;
}

/// Result of one [`Agent::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub status: ExitStatus,
    pub conversation: Vec<ChatMessage>,
    pub auto_exec: bool,
    /// Steps taken in the last user turn.
    pub steps: usize,
}

enum State {
    AwaitingModel,
    ParseReply(String),
    Confirm {
        tool: Arc<dyn Capability>,
        input: String,
    },
    Execute {
        tool: Arc<dyn Capability>,
        input: String,
        decision: SafetyDecision,
    },
    Done,
    Cancelled,
    TransportFailed(TransportError),
    StepsExhausted,
}

impl State {
    fn label(&self) -> &'static str {
        match self {
            Self::AwaitingModel => "awaiting-model",
            Self::ParseReply(_) => "parse-reply",
            Self::Confirm { .. } => "confirm",
            Self::Execute { .. } => "execute",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::TransportFailed(_) => "transport-failed",
            Self::StepsExhausted => "steps-exhausted",
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum Observation<'a> {
    Tool {
        tool: &'a str,
        result: &'a ToolResult,
    },
    Error {
        error: &'a str,
    },
}

struct Session<'a> {
    options: &'a AgentOptions,
    host: &'a mut dyn AgentHost,
    conversation: Vec<ChatMessage>,
    auto_exec: bool,
    steps: usize,
}

impl Session<'_> {
    fn flags(&self) -> PolicyFlags {
        PolicyFlags {
            dry_run: self.options.dry_run,
            unsafe_exec: self.options.unsafe_exec,
            auto_exec: self.auto_exec,
        }
    }

    /// Appends an observation and spends one step.
    fn observe(&mut self, observation: Observation<'_>) -> State {
        let payload = match serde_json::to_string(&observation) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to serialize observation");
                format!("{{\"error\":\"{error}\"}}")
            }
        };
        self.conversation
            .push(ChatMessage::user(format!("{OBSERVATION_PREFIX}{payload}")));

        self.steps += 1;
        if self.steps >= self.options.max_steps {
            State::StepsExhausted
        } else {
            State::AwaitingModel
        }
    }
}

/// Drives the loop for one invocation.
pub struct Agent {
    provider: Arc<dyn CompletionProvider>,
    tools: ToolRegistry,
    policy: SafetyPolicy,
    cancel: CancelSignal,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        tools: ToolRegistry,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            provider,
            tools,
            policy: SafetyPolicy::builtin(),
            cancel,
        }
    }

    pub fn with_policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn run(
        &self,
        system_prompt: &str,
        initial_prompt: &str,
        options: &AgentOptions,
        host: &mut dyn AgentHost,
    ) -> AgentRun {
        let (prompt, auto_exec) = match strip_auto_exec(initial_prompt) {
            Some(stripped) => (stripped, true),
            None => (initial_prompt.to_string(), options.auto_exec),
        };
        if auto_exec && !options.auto_exec {
            host.notify(Notice::AutoExecEnabled);
        }

        let mut session = Session {
            options,
            host,
            conversation: vec![ChatMessage::system(system_prompt), ChatMessage::user(prompt)],
            auto_exec,
            steps: 0,
        };

        let mut state = State::AwaitingModel;
        let status = loop {
            debug!(state = state.label(), step = session.steps, "agent transition");
            state = match state {
                State::AwaitingModel => self.await_model(&mut session),
                State::ParseReply(reply) => self.parse_reply(&mut session, reply),
                State::Confirm { tool, input } => self.confirm(&mut session, tool, input),
                State::Execute {
                    tool,
                    input,
                    decision,
                } => self.execute(&mut session, tool, &input, &decision),
                State::Done => break ExitStatus::Success,
                State::Cancelled => {
                    session.host.notify(Notice::Cancelled);
                    break ExitStatus::Cancelled;
                }
                State::TransportFailed(error) => {
                    session.host.notify(Notice::TransportFailed(error));
                    break ExitStatus::TransportFailed;
                }
                State::StepsExhausted => {
                    session.host.notify(Notice::StepsExhausted {
                        max_steps: options.max_steps,
                    });
                    break ExitStatus::StepsExhausted;
                }
            };
        };

        AgentRun {
            status,
            conversation: session.conversation,
            auto_exec: session.auto_exec,
            steps: session.steps,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn await_model(&self, session: &mut Session<'_>) -> State {
        if self.is_cancelled() {
            return State::Cancelled;
        }

        let request = CompletionRequest {
            model: session.options.model.clone(),
            messages: session.conversation.clone(),
        };
        debug!(messages = request.messages.len(), "requesting completion");

        let mut stream = match CompletionStream::start(
            Arc::clone(&self.provider),
            request,
            Arc::clone(&self.cancel),
        ) {
            Ok(stream) => stream,
            Err(error) => return State::TransportFailed(error),
        };

        let mut reply = String::new();
        for fragment in &mut stream {
            session.host.write_fragment(&fragment);
            reply.push_str(&fragment);
        }
        session.host.end_reply();

        match stream.into_termination() {
            StreamTermination::Completed => State::ParseReply(reply),
            StreamTermination::Cancelled => State::Cancelled,
            StreamTermination::Failed(error) => State::TransportFailed(error),
        }
    }

    fn parse_reply(&self, session: &mut Session<'_>, reply: String) -> State {
        let extracted = directive::extract(&reply);
        session.conversation.push(ChatMessage::assistant(reply));

        match extracted {
            Ok(Directive::FinalAnswer { text }) => {
                session.host.show_final(&text);
                self.follow_up(session)
            }
            Ok(Directive::ToolCall { tool, input }) => match self.tools.resolve(&tool) {
                Ok(capability) => {
                    let decision = self.policy.evaluate(&input, session.flags());
                    debug!(tool = %tool, decision = decision.label(), "tool call");
                    session.host.notify(Notice::ToolCall {
                        tool,
                        input: input.clone(),
                        decision: decision.clone(),
                    });

                    match decision {
                        SafetyDecision::Confirm => State::Confirm {
                            tool: capability,
                            input,
                        },
                        decision => State::Execute {
                            tool: capability,
                            input,
                            decision,
                        },
                    }
                }
                Err(error) => {
                    let error = error.to_string();
                    warn!(tool = %tool, "model requested unknown tool");
                    session.host.notify(Notice::UnknownTool {
                        name: tool.clone(),
                        error: error.clone(),
                    });
                    let result = ToolResult::failure(error);
                    session.observe(Observation::Tool {
                        tool: &tool,
                        result: &result,
                    })
                }
            },
            Err(failure) => {
                debug!(reason = %failure.reason, "reply carried no directive");
                session.host.notify(Notice::Malformed(failure));
                session.observe(Observation::Error {
                    error: MALFORMED_DIRECTIVE_ERROR,
                })
            }
        }
    }

    fn follow_up(&self, session: &mut Session<'_>) -> State {
        if !session.options.continue_conversation {
            return State::Done;
        }

        match session.host.next_prompt() {
            PromptReply::Line(line) => {
                let line = line.trim();
                if line.is_empty() || EXIT_COMMANDS.contains(&line) {
                    return State::Done;
                }
                session.conversation.push(ChatMessage::user(line));
                session.steps = 0;
                State::AwaitingModel
            }
            PromptReply::End => State::Done,
            PromptReply::Interrupted => State::Cancelled,
        }
    }

    fn confirm(
        &self,
        session: &mut Session<'_>,
        tool: Arc<dyn Capability>,
        input: String,
    ) -> State {
        match session.host.confirm(tool.name(), &input) {
            Confirmation::Approved => State::Execute {
                tool,
                input,
                decision: SafetyDecision::Allow,
            },
            Confirmation::Interrupted => State::Cancelled,
            Confirmation::Declined | Confirmation::Unavailable => {
                if self.is_cancelled() {
                    return State::Cancelled;
                }
                session.host.notify(Notice::Refused {
                    command: input,
                    reason: REFUSED_BY_USER.to_string(),
                });
                let result = ToolResult::refused(REFUSED_BY_USER);
                session.observe(Observation::Tool {
                    tool: tool.name(),
                    result: &result,
                })
            }
        }
    }

    fn execute(
        &self,
        session: &mut Session<'_>,
        tool: Arc<dyn Capability>,
        input: &str,
        decision: &SafetyDecision,
    ) -> State {
        if self.is_cancelled() {
            return State::Cancelled;
        }

        if let SafetyDecision::Refuse { reason } = decision {
            session.host.notify(Notice::Refused {
                command: input.to_string(),
                reason: reason.clone(),
            });
        }

        let result = tool.invoke(input, decision);
        session.host.notify(Notice::Observation {
            tool: tool.name().to_string(),
            result: result.clone(),
        });

        let next = session.observe(Observation::Tool {
            tool: tool.name(),
            result: &result,
        });

        if self.is_cancelled() {
            State::Cancelled
        } else {
            next
        }
    }
}

/// Returns the prompt without its leading auto-exec word, if it has one.
pub fn strip_auto_exec(prompt: &str) -> Option<String> {
    let trimmed = prompt.trim_start();
    let (first, rest) = trimmed
        .split_once(char::is_whitespace)
        .unwrap_or((trimmed, ""));

    first
        .eq_ignore_ascii_case(AUTO_EXEC_DIRECTIVE)
        .then(|| rest.trim_start().to_string())
}
