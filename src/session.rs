//! Sandbox sessions and the command protocol.
//!
//! A session owns one sandbox and its attached shell. Commands are framed
//! with a per-command sentinel: after writing the command line the session
//! writes a probe that makes the shell echo `SENTINEL<exit code>SENTINEL`,
//! giving a deterministic end-of-command marker in stdout even for commands
//! that produce no output of their own.

use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use rand::Rng;
use tracing::{debug, warn};

use crate::engine::{EngineError, SandboxEngine, SandboxHandle};

/// Captured result of one command, immutable once produced.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Error type for session operations.
#[derive(Debug)]
pub enum SessionError {
    /// A command was issued on a session that is not started, is dead, or
    /// was stopped.
    NotStarted,
    /// The session was already started once; sessions are single-use.
    AlreadyStarted,
    /// Writing to the attached stream failed.
    Stream(std::io::Error),
    /// The sandbox engine failed.
    Engine(EngineError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotStarted => write!(f, "session is not started"),
            SessionError::AlreadyStarted => write!(f, "session was already started"),
            SessionError::Stream(e) => write!(f, "attached stream failed: {e}"),
            SessionError::Engine(e) => write!(f, "sandbox engine: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Mutable protocol state shared with the stream reader threads.
#[derive(Default)]
struct ProtocolState {
    started: bool,
    out_dialog: Vec<String>,
    err_dialog: Vec<String>,
    /// The sentinel of the in-flight command, if any.
    pending: Option<String>,
    exit_code: i32,
    /// Set when the stream ended while a command was pending.
    died_pending: bool,
}

impl ProtocolState {
    /// Scan the accumulated stdout buffer for the pending completion marker.
    ///
    /// The marker is `SENTINEL<digits>SENTINEL` followed by a newline. The
    /// scan covers everything accumulated since the last flush, not just the
    /// latest fragment, because the marker may be split across deliveries.
    /// The newline requirement keeps a partially delivered exit code from
    /// being consumed early.
    fn try_complete(&mut self) -> bool {
        let Some(sentinel) = &self.pending else {
            return false;
        };
        let sentinel = sentinel.clone();
        let joined: String = self.out_dialog.concat();
        let Some(start) = joined.find(&sentinel) else {
            return false;
        };
        let rest = &joined[start + sentinel.len()..];
        let digits_len = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits_len == 0 {
            return false;
        }
        let tail = &rest[digits_len..];
        if !tail.starts_with(&sentinel) {
            return false;
        }
        let after = &tail[sentinel.len()..];
        if !after.starts_with('\n') {
            return false;
        }

        let exit_code = rest[..digits_len].parse().unwrap_or(1);
        let output = joined[..start].to_string();
        let remainder = after[1..].to_string();
        self.out_dialog.clear();
        if !output.is_empty() {
            self.out_dialog.push(output);
        }
        if !remainder.is_empty() {
            self.out_dialog.push(remainder);
        }
        self.exit_code = exit_code;
        self.pending = None;
        true
    }
}

struct Shared {
    state: Mutex<ProtocolState>,
    completed: Condvar,
}

/// One sandbox with a persistent attached shell and a single in-flight
/// command channel.
///
/// Sessions are single-use: created, started once, driven through commands,
/// and stopped. A stopped or dead session rejects further commands.
pub struct SandboxSession {
    engine: Arc<dyn SandboxEngine>,
    image: String,
    handle: Option<Box<dyn SandboxHandle>>,
    stdin: Option<Box<dyn Write + Send>>,
    shared: Arc<Shared>,
    readers: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl SandboxSession {
    /// Create a session for the given image. The sandbox itself is not
    /// created until [`start`](Self::start).
    pub fn new(engine: Arc<dyn SandboxEngine>, image: &str) -> Self {
        SandboxSession {
            engine,
            image: image.to_string(),
            handle: None,
            stdin: None,
            shared: Arc::new(Shared {
                state: Mutex::new(ProtocolState::default()),
                completed: Condvar::new(),
            }),
            readers: Vec::new(),
            stopped: false,
        }
    }

    /// Create, attach, and start the sandbox with the given `KEY=VALUE`
    /// environment entries.
    pub fn start(&mut self, env_vars: &[String]) -> Result<(), SessionError> {
        if self.handle.is_some() || self.stopped {
            return Err(SessionError::AlreadyStarted);
        }

        let mut handle = self
            .engine
            .create(&self.image, env_vars)
            .map_err(SessionError::Engine)?;
        let crate::engine::Attachment {
            stdin,
            stdout,
            stderr,
        } = handle.attach().map_err(SessionError::Engine)?;

        let shared = Arc::clone(&self.shared);
        let out_reader = thread::spawn(move || read_stdout(stdout, shared));
        let shared = Arc::clone(&self.shared);
        let err_reader = thread::spawn(move || read_stderr(stderr, shared));
        self.readers.push(out_reader);
        self.readers.push(err_reader);

        handle.start().map_err(SessionError::Engine)?;
        self.handle = Some(handle);
        self.stdin = Some(stdin);
        self.shared.state.lock().unwrap().started = true;
        debug!(image = %self.image, "session started");
        Ok(())
    }

    /// Whether the session is started and its shell is alive.
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().unwrap().started
    }

    /// Run one command line in the sandbox shell and wait for its result.
    ///
    /// Writes the raw command line, then the completion probe, and blocks
    /// until the reader thread observes the sentinel marker or the shell
    /// terminates. If the shell terminated before the probe ran, the
    /// command resolves with the shell's own exit status when the engine
    /// can report one, and exit code 1 otherwise.
    pub fn send_command(&mut self, line: &str) -> Result<CommandResult, SessionError> {
        let sentinel = fresh_sentinel();
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.started {
                return Err(SessionError::NotStarted);
            }
            state.pending = Some(sentinel.clone());
            state.died_pending = false;
        }
        debug!(command = line, sentinel = %sentinel, "sending command");

        if let Err(e) = self.write_command(line, &sentinel) {
            self.shared.state.lock().unwrap().pending = None;
            return Err(e);
        }

        let died = {
            let mut state = self.shared.state.lock().unwrap();
            while state.pending.is_some() {
                state = self.shared.completed.wait(state).unwrap();
            }
            std::mem::take(&mut state.died_pending)
        };
        if died {
            let code = self
                .handle
                .as_mut()
                .and_then(|h| h.exit_status())
                .unwrap_or(1);
            debug!(exit_code = code, "shell terminated while command pending");
            self.shared.state.lock().unwrap().exit_code = code;
        }

        Ok(self.flush_output())
    }

    fn write_command(&mut self, line: &str, sentinel: &str) -> Result<(), SessionError> {
        let stdin = self.stdin.as_mut().ok_or(SessionError::NotStarted)?;
        stdin
            .write_all(format!("{line}\n").as_bytes())
            .map_err(SessionError::Stream)?;
        stdin
            .write_all(format!("echo {sentinel}$?{sentinel}\n").as_bytes())
            .map_err(SessionError::Stream)?;
        stdin.flush().map_err(SessionError::Stream)
    }

    /// Join and return everything accumulated on both streams along with
    /// the last recorded exit code, draining the buffers. A second call
    /// with no intervening output yields empty strings.
    pub fn flush_output(&mut self) -> CommandResult {
        let mut state = self.shared.state.lock().unwrap();
        let stdout = state.out_dialog.concat();
        let stderr = state.err_dialog.concat();
        state.out_dialog.clear();
        state.err_dialog.clear();
        CommandResult {
            stdout,
            stderr,
            exit_code: state.exit_code,
        }
    }

    /// Stop and remove the sandbox. Best-effort and idempotent: failures
    /// are logged, never raised, so teardown cannot mask a test outcome.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.state.lock().unwrap().started = false;
        // Dropping stdin closes the shell's input before the engine stop.
        self.stdin = None;
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.stop() {
                warn!(error = %e, "sandbox stop failed");
            }
            if let Err(e) = handle.remove() {
                warn!(error = %e, "sandbox remove failed");
            }
        }
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        debug!(image = %self.image, "session stopped");
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_stdout(mut stream: Box<dyn Read + Send>, shared: Arc<Shared>) {
    let mut buf = [0u8; 8192];
    let mut carry = Vec::new();
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                let Some(fragment) = take_utf8_prefix(&mut carry) else {
                    continue;
                };
                let mut state = shared.state.lock().unwrap();
                state.out_dialog.push(fragment);
                if state.try_complete() {
                    shared.completed.notify_all();
                }
            }
        }
    }
    // Stream end: the shell process is gone. Abandon any pending command
    // and mark the session dead.
    let mut state = shared.state.lock().unwrap();
    if !carry.is_empty() {
        state
            .out_dialog
            .push(String::from_utf8_lossy(&carry).into_owned());
    }
    state.started = false;
    if state.pending.take().is_some() {
        state.died_pending = true;
    }
    shared.completed.notify_all();
}

fn read_stderr(mut stream: Box<dyn Read + Send>, shared: Arc<Shared>) {
    let mut buf = [0u8; 8192];
    let mut carry = Vec::new();
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                if let Some(fragment) = take_utf8_prefix(&mut carry) {
                    shared.state.lock().unwrap().err_dialog.push(fragment);
                }
            }
        }
    }
    if !carry.is_empty() {
        let fragment = String::from_utf8_lossy(&carry).into_owned();
        shared.state.lock().unwrap().err_dialog.push(fragment);
    }
}

/// Take the decodable UTF-8 prefix out of the byte carry, leaving at most
/// one incomplete trailing sequence behind for the next delivery. A
/// multibyte character split across two stream reads must not be decoded
/// piecewise. Invalid bytes become replacement characters so binary output
/// cannot stall the stream.
fn take_utf8_prefix(carry: &mut Vec<u8>) -> Option<String> {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(carry) {
            Ok(s) => {
                out.push_str(s);
                carry.clear();
                break;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&carry[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        carry.drain(..valid + bad);
                    }
                    None => {
                        carry.drain(..valid);
                        break;
                    }
                }
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

/// A fresh per-command sentinel: 16 random letters.
///
/// Letters only, so the digit scan between the two sentinel occurrences can
/// never run into the marker itself. 64 bits of randomness make collision
/// with real program output negligible.
fn fresh_sentinel() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| char::from(b'a' + rng.random_range(0u8..16)))
        .collect()
}
