//! Interactive terminal host.
//!
//! Renders streamed replies, notices, and prompts with ANSI colors, and reads
//! user input on a helper thread so a raised cancel flag interrupts a pending
//! read within one poll interval.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, IsTerminal, Write};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use agent_provider::CancelSignal;
use tracing::debug;

use crate::agent::{AgentHost, Confirmation, Notice, PromptReply};
use crate::config::SetupPrompter;
use crate::safety::SafetyDecision;
use crate::tools::ToolResult;

pub const FOLLOW_UP_PROMPT: &str = "How can I halp? |  ";

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red = 1,
    Green = 2,
    Yellow = 3,
    Blue = 4,
    Magenta = 5,
    Cyan = 6,
}

impl Color {
    fn code(self) -> String {
        format!("\x1b[1;3{}m", self as u8)
    }
}

/// ANSI styling that collapses to plain text when disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    enabled: bool,
}

impl Palette {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn start(&self, color: Color) -> String {
        if self.enabled {
            color.code()
        } else {
            String::new()
        }
    }

    pub fn dim(&self) -> &'static str {
        if self.enabled {
            DIM
        } else {
            ""
        }
    }

    pub fn reset(&self) -> &'static str {
        if self.enabled {
            RESET
        } else {
            ""
        }
    }

    pub fn paint(&self, color: Color, text: &str) -> String {
        format!("{}{text}{}", self.start(color), self.reset())
    }
}

enum ReadOutcome {
    Line(String),
    Eof,
    Interrupted,
    Unavailable,
}

/// Where interactive answers come from: stdin when it is a terminal,
/// otherwise the controlling terminal.
enum InputSource {
    Stdin,
    Tty(File),
}

impl InputSource {
    fn detect() -> Option<Self> {
        if io::stdin().is_terminal() {
            return Some(Self::Stdin);
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/tty")
            .ok()
            .map(Self::Tty)
    }

    fn write_prompt(&mut self, text: &str) -> io::Result<()> {
        match self {
            Self::Stdin => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(text.as_bytes())?;
                stdout.flush()
            }
            Self::Tty(file) => {
                file.write_all(text.as_bytes())?;
                file.flush()
            }
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> libc::c_int {
        use std::os::unix::io::AsRawFd;
        match self {
            Self::Stdin => libc::STDIN_FILENO,
            Self::Tty(file) => file.as_raw_fd(),
        }
    }

    fn spawn_reader(&self) -> io::Result<mpsc::Receiver<io::Result<Option<String>>>> {
        let (sender, receiver) = mpsc::channel();
        let tty = match self {
            Self::Stdin => None,
            Self::Tty(file) => Some(file.try_clone()?),
        };

        thread::Builder::new()
            .name("halp-input".to_string())
            .spawn(move || {
                let mut line = String::new();
                let read = match tty {
                    Some(file) => BufReader::new(file).read_line(&mut line),
                    None => io::stdin().lock().read_line(&mut line),
                };
                let _ = sender.send(read.map(|count| (count > 0).then_some(line)));
            })?;

        Ok(receiver)
    }
}

/// Turns terminal echo off until dropped.
#[cfg(unix)]
struct EchoGuard {
    fd: libc::c_int,
    original: libc::termios,
}

#[cfg(unix)]
impl EchoGuard {
    fn disable(fd: libc::c_int) -> io::Result<Self> {
        let original = get_termios(fd)?;
        let mut silent = original;
        silent.c_lflag &= !libc::ECHO;
        silent.c_lflag |= libc::ECHONL;
        set_termios(fd, &silent)?;
        Ok(Self { fd, original })
    }
}

#[cfg(unix)]
impl Drop for EchoGuard {
    fn drop(&mut self) {
        let _ = set_termios(self.fd, &self.original);
    }
}

#[cfg(unix)]
fn get_termios(fd: libc::c_int) -> io::Result<libc::termios> {
    let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
    let result = unsafe { libc::tcgetattr(fd, &mut termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(termios)
}

#[cfg(unix)]
fn set_termios(fd: libc::c_int, termios: &libc::termios) -> io::Result<()> {
    let result = unsafe { libc::tcsetattr(fd, libc::TCSANOW, termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// [`AgentHost`] backed by the process terminal.
pub struct TerminalHost {
    palette: Palette,
    cancel: CancelSignal,
    reply_open: bool,
}

impl TerminalHost {
    pub fn new(cancel: CancelSignal, no_color: bool) -> Self {
        Self {
            palette: Palette::new(!no_color && io::stdout().is_terminal()),
            cancel,
            reply_open: false,
        }
    }

    pub fn palette(&self) -> Palette {
        self.palette
    }

    /// Asks for a prompt line, used for the first turn when none was given.
    pub fn ask_prompt(&mut self) -> PromptReply {
        match self.read_line(FOLLOW_UP_PROMPT, false) {
            ReadOutcome::Line(line) => PromptReply::Line(line),
            ReadOutcome::Eof | ReadOutcome::Unavailable => PromptReply::End,
            ReadOutcome::Interrupted => PromptReply::Interrupted,
        }
    }

    pub fn error(&self, message: &str) {
        eprintln!("{}", self.palette.paint(Color::Red, message));
    }

    fn read_line(&mut self, label: &str, secret: bool) -> ReadOutcome {
        let Some(mut source) = InputSource::detect() else {
            debug!("no interactive input available");
            return ReadOutcome::Unavailable;
        };

        let prompt = format!(
            "{}{label}{}",
            self.palette.start(Color::Blue),
            self.palette.start(Color::Magenta)
        );
        if source.write_prompt(&prompt).is_err() {
            return ReadOutcome::Unavailable;
        }

        #[cfg(unix)]
        let _echo = if secret {
            EchoGuard::disable(source.raw_fd()).ok()
        } else {
            None
        };
        #[cfg(not(unix))]
        let _ = secret;

        let outcome = self.await_line(&source);
        let _ = source.write_prompt(self.palette.reset());
        if matches!(outcome, ReadOutcome::Interrupted) {
            let _ = source.write_prompt("\n");
        }
        outcome
    }

    fn await_line(&self, source: &InputSource) -> ReadOutcome {
        let receiver = match source.spawn_reader() {
            Ok(receiver) => receiver,
            Err(error) => {
                debug!(%error, "failed to start input reader");
                return ReadOutcome::Unavailable;
            }
        };

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return ReadOutcome::Interrupted;
            }
            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(Some(line))) => {
                    return ReadOutcome::Line(line.trim_end_matches(['\r', '\n']).to_string());
                }
                Ok(Ok(None)) | Err(RecvTimeoutError::Disconnected) => return ReadOutcome::Eof,
                Ok(Err(error)) if error.kind() == io::ErrorKind::Interrupted => {
                    return ReadOutcome::Interrupted;
                }
                Ok(Err(error)) => {
                    debug!(%error, "input read failed");
                    return ReadOutcome::Eof;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn print(&self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{text}");
        let _ = stdout.flush();
    }
}

impl AgentHost for TerminalHost {
    fn write_fragment(&mut self, fragment: &str) {
        let mut stdout = io::stdout().lock();
        if !self.reply_open {
            let _ = stdout.write_all(self.palette.dim().as_bytes());
            self.reply_open = true;
        }
        let _ = stdout.write_all(fragment.as_bytes());
        let _ = stdout.flush();
    }

    fn end_reply(&mut self) {
        if self.reply_open {
            self.reply_open = false;
            self.print(self.palette.reset());
        }
    }

    fn show_final(&mut self, text: &str) {
        self.print(&self.palette.paint(Color::Green, text.trim()));
    }

    fn notify(&mut self, notice: Notice) {
        let palette = self.palette;
        match notice {
            Notice::AutoExecEnabled => eprintln!(
                "{}",
                palette.paint(Color::Yellow, "yolo: auto-executing commands for this session")
            ),
            Notice::ToolCall {
                input, decision, ..
            } => self.print(&palette.paint(Color::Cyan, &tool_call_line(&input, &decision))),
            Notice::Refused { command, reason } => eprintln!(
                "{}",
                palette.paint(Color::Red, &format!("Not executed ({reason}): {command}"))
            ),
            Notice::Malformed(failure) => {
                eprintln!(
                    "{}",
                    palette.paint(Color::Red, "<MALFORMED TOOL CALL - RETRYING>")
                );
                eprintln!("{}", palette.paint(Color::Yellow, &failure.reason.to_string()));
            }
            Notice::UnknownTool { error, .. } => {
                eprintln!("{}", palette.paint(Color::Yellow, &error));
            }
            Notice::Observation { result, .. } => {
                if !result.stdout.is_empty() {
                    self.print(result.stdout.trim_end_matches('\n'));
                }
                if !result.stderr.is_empty() {
                    eprintln!(
                        "{}",
                        palette.paint(Color::Yellow, result.stderr.trim_end_matches('\n'))
                    );
                }
                self.print(&format!(
                    "{}{}{}",
                    palette.dim(),
                    result_status(&result),
                    palette.reset()
                ));
            }
            Notice::TransportFailed(error) => self.error(&format!("Request failed: {error}")),
            Notice::StepsExhausted { max_steps } => self.error(&format!(
                "Agent reached max steps ({max_steps}) without finishing."
            )),
            Notice::Cancelled => {
                print!("{}", palette.reset());
                let _ = io::stdout().flush();
                eprintln!("{}", palette.paint(Color::Yellow, "Interrupted."));
            }
        }
    }

    fn confirm(&mut self, tool: &str, command: &str) -> Confirmation {
        match self.read_line(&confirmation_prompt(tool, command), false) {
            ReadOutcome::Line(answer) if is_affirmative(&answer) => Confirmation::Approved,
            ReadOutcome::Line(_) => Confirmation::Declined,
            ReadOutcome::Eof | ReadOutcome::Unavailable => Confirmation::Unavailable,
            ReadOutcome::Interrupted => Confirmation::Interrupted,
        }
    }

    fn next_prompt(&mut self) -> PromptReply {
        self.ask_prompt()
    }
}

impl SetupPrompter for TerminalHost {
    fn ask(&mut self, label: &str) -> io::Result<String> {
        setup_answer(self.read_line(label, false))
    }

    fn ask_secret(&mut self, label: &str) -> io::Result<String> {
        setup_answer(self.read_line(label, true))
    }

    fn announce(&mut self, message: &str) {
        self.print(message);
    }
}

fn setup_answer(outcome: ReadOutcome) -> io::Result<String> {
    match outcome {
        ReadOutcome::Line(line) => Ok(line),
        ReadOutcome::Interrupted => Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "interrupted by user",
        )),
        ReadOutcome::Eof | ReadOutcome::Unavailable => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "no interactive input available",
        )),
    }
}

pub fn confirmation_prompt(tool: &str, command: &str) -> String {
    format!("Approve {tool} command? [y/N]\n  {command}\n-> ")
}

pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn tool_call_line(input: &str, decision: &SafetyDecision) -> String {
    match decision {
        SafetyDecision::Simulate => format!("$ {input}  (dry run)"),
        _ => format!("$ {input}"),
    }
}

fn result_status(result: &ToolResult) -> String {
    match (&result.reason, result.return_code) {
        (Some(reason), _) => format!("[{reason}]"),
        (None, Some(code)) => format!("[exit {code}]"),
        (None, None) => "[no exit code]".to_string(),
    }
}
