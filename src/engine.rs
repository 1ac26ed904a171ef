//! Sandbox engine interface and implementations.
//!
//! An engine provides isolated execution environments, each hosting one
//! persistent shell process reachable through a bidirectional attachment.
//! Sessions drive handles through create → attach → start, and tear them
//! down with stop → remove.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::debug;

/// Error type for sandbox engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// Failed to spawn a process.
    Spawn(std::io::Error),
    /// The docker CLI reported a failure.
    Docker(String),
    /// The sandbox is not in a state that allows the operation.
    State(&'static str),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Spawn(e) => write!(f, "failed to spawn: {e}"),
            EngineError::Docker(msg) => write!(f, "docker: {msg}"),
            EngineError::State(msg) => write!(f, "invalid sandbox state: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// The streams of an attached sandbox shell.
pub struct Attachment {
    pub stdin: Box<dyn Write + Send>,
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Box<dyn Read + Send>,
}

/// Creates sandboxes. One engine may serve many independent sessions.
pub trait SandboxEngine: Send + Sync {
    /// Create a sandbox from an image reference with the given
    /// `KEY=VALUE` environment entries.
    fn create(&self, image: &str, env: &[String]) -> Result<Box<dyn SandboxHandle>, EngineError>;
}

/// One created sandbox. Owned exclusively by its session.
pub trait SandboxHandle: Send {
    /// Attach to the sandbox shell's stdio. May be called once.
    fn attach(&mut self) -> Result<Attachment, EngineError>;

    /// Start the sandbox after attaching.
    fn start(&mut self) -> Result<(), EngineError>;

    /// Request a graceful stop of the sandbox.
    fn stop(&mut self) -> Result<(), EngineError>;

    /// Remove the sandbox's backing resources.
    fn remove(&mut self) -> Result<(), EngineError>;

    /// The recorded exit status of the shell process, if it has terminated
    /// and a status is obtainable. Used to resolve a command that was
    /// pending when the attached stream ended.
    fn exit_status(&mut self) -> Option<i32>;
}

/// Runs the sandbox shell as a local child process.
///
/// No isolation beyond a fresh process: useful for host-local runs and for
/// exercising the command protocol in tests. The image reference is ignored.
pub struct ProcessEngine {
    shell: String,
}

impl ProcessEngine {
    pub fn new() -> Self {
        ProcessEngine {
            shell: "bash".to_string(),
        }
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxEngine for ProcessEngine {
    fn create(&self, image: &str, env: &[String]) -> Result<Box<dyn SandboxHandle>, EngineError> {
        debug!(image, shell = %self.shell, "creating process sandbox");
        let mut cmd = Command::new(&self.shell);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        let child = cmd.spawn().map_err(EngineError::Spawn)?;
        Ok(Box::new(ProcessHandle { child }))
    }
}

struct ProcessHandle {
    child: Child,
}

impl SandboxHandle for ProcessHandle {
    fn attach(&mut self) -> Result<Attachment, EngineError> {
        let stdin = self.child.stdin.take();
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        match (stdin, stdout, stderr) {
            (Some(i), Some(o), Some(e)) => Ok(Attachment {
                stdin: Box::new(i),
                stdout: Box::new(o),
                stderr: Box::new(e),
            }),
            _ => Err(EngineError::State("already attached")),
        }
    }

    fn start(&mut self) -> Result<(), EngineError> {
        // The shell is spawned at create; nothing further to do.
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        self.child.kill().map_err(EngineError::Spawn)?;
        self.child.wait().map_err(EngineError::Spawn)?;
        Ok(())
    }

    fn remove(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn exit_status(&mut self) -> Option<i32> {
        wait_with_grace(&mut self.child)
    }
}

/// Reap the child's exit status without blocking indefinitely.
///
/// The child's streams can close slightly before the process becomes
/// reapable, so a short grace window is allowed. A child that stays alive
/// (it closed a stream without exiting) yields no status.
fn wait_with_grace(child: &mut Child) -> Option<i32> {
    for _ in 0..50 {
        match child.try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) => thread::sleep(Duration::from_millis(10)),
            Err(_) => return None,
        }
    }
    None
}

/// Runs each sandbox as a Docker container via the `docker` CLI.
///
/// The container is created with stdin open and no TTY, running `bash` as
/// its persistent process; `docker start -ai` both starts the container and
/// yields the attached streams, with the CLI demultiplexing stdout/stderr.
pub struct DockerEngine;

impl DockerEngine {
    pub fn new() -> Self {
        DockerEngine
    }

    fn docker(args: &[&str]) -> Result<String, EngineError> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .map_err(EngineError::Spawn)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Docker(format!(
                "`docker {}` failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxEngine for DockerEngine {
    fn create(&self, image: &str, env: &[String]) -> Result<Box<dyn SandboxHandle>, EngineError> {
        let mut args: Vec<&str> = vec!["create", "-i"];
        let env_flags: Vec<String> = env.iter().map(|e| e.to_string()).collect();
        for entry in &env_flags {
            args.push("-e");
            args.push(entry);
        }
        args.push(image);
        args.push("bash");
        let id = Self::docker(&args)?;
        debug!(image, container = %id, "created container");
        Ok(Box::new(DockerHandle {
            id,
            attach_child: None,
        }))
    }
}

struct DockerHandle {
    id: String,
    attach_child: Option<Child>,
}

impl SandboxHandle for DockerHandle {
    fn attach(&mut self) -> Result<Attachment, EngineError> {
        if self.attach_child.is_some() {
            return Err(EngineError::State("already attached"));
        }
        // `start -ai` attaches and starts in one step; `start()` below is
        // the confirmation that the container came up.
        let mut child = Command::new("docker")
            .args(["start", "-ai", &self.id])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(EngineError::Spawn)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.attach_child = Some(child);
        match (stdin, stdout, stderr) {
            (Some(i), Some(o), Some(e)) => Ok(Attachment {
                stdin: Box::new(i),
                stdout: Box::new(o),
                stderr: Box::new(e),
            }),
            _ => Err(EngineError::State("attach streams unavailable")),
        }
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.attach_child.is_none() {
            return Err(EngineError::State("not attached"));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        DockerEngine::docker(&["stop", "-t", "2", &self.id])?;
        if let Some(mut child) = self.attach_child.take() {
            let _ = child.wait();
        }
        Ok(())
    }

    fn remove(&mut self) -> Result<(), EngineError> {
        DockerEngine::docker(&["rm", "-f", &self.id])?;
        Ok(())
    }

    fn exit_status(&mut self) -> Option<i32> {
        // `docker start -ai` exits with the container's exit code.
        self.attach_child.as_mut().and_then(wait_with_grace)
    }
}
