use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use agent_provider::CancelSignal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::safety::SafetyDecision;

pub const SHELL_TOOL_NAME: &str = "shell";
pub const SHELL_TOOL_DESCRIPTION: &str = "Execute shell commands on the local system. Input is a single string. Use responsibly. Commands will require confirmation unless --unsafe_exec is set.";

pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_OUTPUT_BYTES: usize = 100 * 1024;
const WAIT_SLICE: Duration = Duration::from_millis(25);
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);
const PIPE_CHUNK_BYTES: usize = 8 * 1024;
const SIMULATED_STDOUT: &str = "<simulated>";

/// Outcome of one tool invocation, fed back to the model as an observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ToolResult {
    /// The command was never run.
    pub fn refused(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            ok: false,
            return_code: None,
            stdout: String::new(),
            stderr: format!("Command not executed: {reason}"),
            reason: Some(reason),
        }
    }

    /// The tool itself failed before producing process output.
    pub fn failure(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            ok: false,
            return_code: None,
            stdout: String::new(),
            stderr: reason.clone(),
            reason: Some(reason),
        }
    }

    pub fn simulated(command: &str) -> Self {
        Self {
            ok: true,
            return_code: Some(0),
            stdout: SIMULATED_STDOUT.to_string(),
            stderr: format!("would execute -> {command}"),
            reason: None,
        }
    }
}

/// A named action the model may request.
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Runs the capability under an already-resolved safety decision.
    fn invoke(&self, input: &str, decision: &SafetyDecision) -> ToolResult;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolLookupError {
    #[error("unknown tool `{name}` (available: {})", .available.join(", "))]
    NotFound {
        name: String,
        available: Vec<String>,
    },
}

/// Collects capabilities before a session starts.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Arc<dyn Capability>>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `capability`, replacing any earlier one with the same name.
    pub fn register(mut self, capability: Arc<dyn Capability>) -> Self {
        let name = capability.name().to_string();
        if self.tools.insert(name.clone(), capability).is_some() {
            warn!(tool = %name, "replacing previously registered tool");
        }
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            tools: Arc::new(self.tools),
        }
    }
}

/// Immutable name → capability table shared by one session.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<BTreeMap<String, Arc<dyn Capability>>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    /// Registry holding only the shell capability.
    pub fn with_shell(shell: ShellTool) -> Self {
        Self::builder().register(Arc::new(shell)).build()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Capability>, ToolLookupError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolLookupError::NotFound {
                name: name.to_string(),
                available: self.tools.keys().cloned().collect(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Capability> + '_ {
        self.tools.values().map(|tool| tool.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

/// Raw result of one subprocess run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal or on timeout.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub interrupted: bool,
}

/// Bounds applied to one subprocess run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Bytes kept per stream; anything past this is read and discarded.
    pub max_output_bytes: usize,
}

/// Spawns shell commands. Tests substitute a counting fake.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        command: &str,
        limits: RunLimits,
        cancel: Option<&CancelSignal>,
    ) -> Result<CommandOutput, String>;
}

/// Runs commands through `sh -c` in their own process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        command: &str,
        limits: RunLimits,
        cancel: Option<&CancelSignal>,
    ) -> Result<CommandOutput, String> {
        let mut builder = Command::new("sh");
        builder
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            builder.process_group(0);
        }

        let mut child = builder
            .spawn()
            .map_err(|error| format!("Failed to launch shell command: {error}"))?;
        debug!(pid = child.id(), "spawned shell command");

        // One extra byte lets `execute` tell a full stream from a cut one.
        let keep = limits.max_output_bytes.saturating_add(1);
        let stdout_reader = spawn_pipe_reader("halp-stdout", child.stdout.take(), keep);
        let stderr_reader = spawn_pipe_reader("halp-stderr", child.stderr.take(), keep);

        let deadline = Instant::now() + limits.timeout;
        let mut timed_out = false;
        let mut interrupted = false;

        let status = loop {
            if cancel.is_some_and(|cancel| cancel.load(Ordering::SeqCst)) {
                interrupted = true;
                break terminate(&mut child)?;
            }

            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break terminate(&mut child)?;
            }

            match child.wait_timeout(WAIT_SLICE.min(deadline - now)) {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(error) => {
                    let _ = terminate(&mut child);
                    return Err(format!("Failed waiting for shell command: {error}"));
                }
            }
        };

        // Background jobs left in the group would hold the pipes open.
        kill_process_group(child.id());

        let drain_deadline = Instant::now() + PIPE_DRAIN_GRACE;
        Ok(CommandOutput {
            status: if timed_out || interrupted {
                None
            } else {
                exit_code(status)
            },
            stdout: collect_pipe(stdout_reader, drain_deadline),
            stderr: collect_pipe(stderr_reader, drain_deadline),
            timed_out,
            interrupted,
        })
    }
}

/// The built-in `shell` capability.
pub struct ShellTool {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    max_output_bytes: usize,
    cancel: Option<CancelSignal>,
}

impl ShellTool {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: DEFAULT_SHELL_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            cancel: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Kills the running command when `cancel` is raised.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn execute(&self, command: &str) -> ToolResult {
        let limits = RunLimits {
            timeout: self.timeout,
            max_output_bytes: self.max_output_bytes,
        };
        let output = match self.runner.run(command, limits, self.cancel.as_ref()) {
            Ok(output) => output,
            Err(error) => return ToolResult::failure(error),
        };

        let stdout = truncate_to_byte_limit(
            String::from_utf8_lossy(&output.stdout).into_owned(),
            self.max_output_bytes,
        );
        let mut stderr = truncate_to_byte_limit(
            String::from_utf8_lossy(&output.stderr).into_owned(),
            self.max_output_bytes,
        );

        let reason = if output.timed_out {
            Some(format!(
                "command timed out after {}s",
                self.timeout.as_secs_f64()
            ))
        } else if output.interrupted {
            Some("command interrupted".to_string())
        } else {
            None
        };

        if let Some(reason) = &reason {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(reason);
        }

        debug!(
            return_code = ?output.status,
            timed_out = output.timed_out,
            interrupted = output.interrupted,
            "shell command finished"
        );

        ToolResult {
            ok: reason.is_none() && output.status == Some(0),
            return_code: output.status,
            stdout,
            stderr,
            reason,
        }
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Capability for ShellTool {
    fn name(&self) -> &str {
        SHELL_TOOL_NAME
    }

    fn description(&self) -> &str {
        SHELL_TOOL_DESCRIPTION
    }

    fn invoke(&self, input: &str, decision: &SafetyDecision) -> ToolResult {
        match decision {
            SafetyDecision::Allow => self.execute(input),
            SafetyDecision::Simulate => ToolResult::simulated(input),
            SafetyDecision::Refuse { reason } => ToolResult::refused(reason.clone()),
            SafetyDecision::Confirm => ToolResult::refused("confirmation required"),
        }
    }
}

fn terminate(child: &mut Child) -> Result<ExitStatus, String> {
    kill_process_group(child.id());
    let _ = child.kill();
    child
        .wait()
        .map_err(|error| format!("Failed to reap shell command: {error}"))
}

/// Sends SIGKILL to the process group created at spawn. A group that is
/// already gone is not an error.
fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        if let Ok(pid) = libc::pid_t::try_from(pid) {
            // SAFETY: kill(2) has no memory-safety preconditions.
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn spawn_pipe_reader<R>(name: &str, pipe: Option<R>, keep: usize) -> Option<Receiver<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let pipe = pipe?;
    let (sender, receiver) = mpsc::channel();
    match thread::Builder::new()
        .name(name.to_string())
        .spawn(move || read_pipe_chunks(pipe, keep, &sender))
    {
        Ok(_) => Some(receiver),
        Err(error) => {
            warn!(%error, "failed to spawn pipe reader");
            None
        }
    }
}

/// Forwards the first `keep` bytes of `pipe` and drains the rest, so a
/// chatty command neither fills memory nor blocks on a full pipe.
fn read_pipe_chunks(mut pipe: impl Read, keep: usize, sender: &Sender<Vec<u8>>) {
    let mut kept = (&mut pipe).take(keep as u64);
    let mut buffer = [0_u8; PIPE_CHUNK_BYTES];
    loop {
        match kept.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => {
                if sender.send(buffer[..count].to_vec()).is_err() {
                    return;
                }
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                warn!(%error, "failed to read command output");
                return;
            }
        }
    }

    if let Err(error) = io::copy(&mut pipe, &mut io::sink()) {
        warn!(%error, "failed to drain command output");
    }
}

/// Gathers forwarded chunks until the writer closes or `deadline` passes.
fn collect_pipe(receiver: Option<Receiver<Vec<u8>>>, deadline: Instant) -> Vec<u8> {
    let mut bytes = Vec::new();
    let Some(receiver) = receiver else {
        return bytes;
    };

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok(chunk) => bytes.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                warn!("command output still open after the process group was killed");
                break;
            }
        }
    }
    bytes
}

fn truncate_to_byte_limit(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }

    let mut cutoff = max_bytes.min(content.len());
    while cutoff > 0 && !content.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = content[..cutoff].to_string();
    truncated.push_str("\n[truncated]");
    truncated
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    status.code()
}
