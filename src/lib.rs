//! halp: a terminal assistant for OpenAI-compatible chat endpoints.
//!
//! The library holds the guarded agent loop and its leaves: directive
//! extraction, the shell safety policy, the tool registry, and the streaming
//! completion consumer. Terminal I/O, configuration, and the CLI surface sit
//! around that core and talk to it through [`agent::AgentHost`].

pub mod agent;
pub mod cli;
pub mod config;
pub mod directive;
pub mod interrupt;
pub mod logging;
pub mod prompt;
pub mod safety;
pub mod stream;
pub mod terminal;
pub mod tools;

pub use agent::{
    Agent, AgentHost, AgentOptions, AgentRun, Confirmation, ExitStatus, Notice, PromptReply,
};
pub use directive::{classify, extract, Directive, ExtractionFailure, PayloadShape};
pub use safety::{evaluate, PolicyFlags, SafetyDecision, SafetyPolicy};
pub use stream::{CompletionStream, StreamTermination};
pub use tools::{Capability, ToolRegistry, ToolRegistryBuilder, ToolResult};
