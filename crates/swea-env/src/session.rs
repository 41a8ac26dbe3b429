// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::EnvError;

/// How one exec finished.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Captured stdout + stderr, possibly truncated.
    pub stdout: String,
    /// Exit code of the command; -1 when the command was cut short.
    pub exit_code: i32,
    pub duration: Duration,
    /// Set when the whole-command or no-output timeout fired.  Never fatal
    /// by itself: the caller turns it into an observation.
    pub timed_out: bool,
}

/// How to (re)build the shell process.  Stored so a killed shell can be
/// rebuilt from scratch after a timeout.
#[derive(Debug, Clone)]
pub struct ShellSpawn {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ShellSpawn {
    /// A plain bash on the host, used by the local deployment and tests.
    pub fn local_bash(cwd: Option<PathBuf>) -> Self {
        Self {
            program: "bash".into(),
            args: vec!["--noprofile".into(), "--norc".into()],
            cwd,
        }
    }

    /// An interactive exec into a running container.
    pub fn docker_exec(container: &str) -> Self {
        Self {
            program: "docker".into(),
            args: vec![
                "exec".into(),
                "-i".into(),
                container.into(),
                "bash".into(),
                "--noprofile".into(),
                "--norc".into(),
            ],
            cwd: None,
        }
    }
}

/// Knobs for a session, taken from the environment config.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub startup_timeout: Duration,
    pub kill_grace: Duration,
    pub output_cap_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(5),
            output_cap_bytes: 1024 * 1024,
        }
    }
}

/// One long-lived interactive shell inside a sandbox.
///
/// Commands are framed with a random marker negotiated at start: after each
/// command the shell prints `\n<marker><exit_code>\n`, and everything before
/// that line is the command's output.  Only a marker at the start of a line
/// followed immediately by an integer terminates a command, so output that
/// happens to contain the marker bytes cannot break framing.
///
/// A session is strictly serial — `exec` takes `&mut self`.
#[derive(Debug)]
pub struct SessionShell {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    marker: String,
    spawn: ShellSpawn,
    /// Commands replayed into every fresh shell (rc sourcing, env seeding).
    init_commands: Vec<String>,
    options: SessionOptions,
}

impl SessionShell {
    /// Bring up the shell, negotiate the marker, and run the init commands.
    /// Fails with `EnvError::Unreachable` when the shell does not come up
    /// within the startup timeout.
    pub async fn start(
        spawn: ShellSpawn,
        init_commands: Vec<String>,
        options: SessionOptions,
    ) -> Result<Self, EnvError> {
        let marker = format!("_SWEA_MARK_{:016x}_", rand::random::<u64>());
        let (child, stdin, stdout) = spawn_shell(&spawn)?;
        let mut session = Self {
            child,
            stdin,
            stdout,
            marker,
            spawn,
            init_commands,
            options,
        };
        session.initialize().await?;
        Ok(session)
    }

    /// Run the session preamble: merge stderr into stdout, disable job
    /// control noise, source rc files, then probe that the shell answers.
    async fn initialize(&mut self) -> Result<(), EnvError> {
        let startup = self.options.startup_timeout;
        let init: Vec<String> = self.init_commands.clone();
        let probe = self
            .exec("exec 2>&1; set +m; echo __swea_ready", startup, startup)
            .await?;
        if probe.timed_out || !probe.stdout.contains("__swea_ready") {
            return Err(EnvError::Unreachable(format!(
                "shell did not come up within {}",
                humantime_secs(startup)
            )));
        }
        for command in init {
            let result = self.exec(&command, startup, startup).await?;
            if result.timed_out {
                return Err(EnvError::Unreachable(format!(
                    "session init command timed out: {command}"
                )));
            }
            if result.exit_code != 0 {
                warn!(%command, code = result.exit_code, "session init command failed");
            }
        }
        Ok(())
    }

    /// Run one command to completion.
    ///
    /// `timeout` bounds total wall time; `no_output_timeout` fires when no
    /// byte arrives for that long.  Either firing interrupts the foreground
    /// group, drains for a grace period, and — if the shell is wedged —
    /// kills and rebuilds it.  The result then carries the partial output
    /// with exit code -1 and `timed_out` set.
    pub async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        no_output_timeout: Duration,
    ) -> Result<ExecResult, EnvError> {
        let started = Instant::now();
        // The leading \n in the sentinel guarantees the marker begins a line
        // even when the command's output lacks a trailing newline; exactly
        // one injected newline is stripped from the captured output below.
        let framed = format!(
            "{command}\nprintf '\\n%s%d\\n' '{marker}' \"$?\"\n",
            marker = self.marker
        );
        self.stdin
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| EnvError::Unreachable(format!("writing to shell: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| EnvError::Unreachable(format!("flushing shell stdin: {e}")))?;

        let mut output: Vec<u8> = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 8192];

        loop {
            let Some(remaining) = timeout.checked_sub(started.elapsed()) else {
                return self
                    .recover_from_timeout(started, output, pending)
                    .await;
            };
            let window = remaining.min(no_output_timeout).max(Duration::from_millis(1));
            match tokio::time::timeout(window, self.stdout.read(&mut chunk)).await {
                Err(_) => {
                    return self
                        .recover_from_timeout(started, output, pending)
                        .await;
                }
                Ok(Ok(0)) => {
                    return Err(EnvError::Unreachable("shell closed its output".into()));
                }
                Ok(Err(e)) => {
                    return Err(EnvError::Unreachable(format!("reading from shell: {e}")));
                }
                Ok(Ok(n)) => {
                    pending.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        if let Some(code) = self.parse_marker_line(&line) {
                            // Strip the single newline injected by the sentinel.
                            if output.last() == Some(&b'\n') {
                                output.pop();
                            }
                            return Ok(ExecResult {
                                stdout: self.cap_output(output),
                                exit_code: code,
                                duration: started.elapsed(),
                                timed_out: false,
                            });
                        }
                        output.extend_from_slice(&line);
                    }
                }
            }
        }
    }

    /// A line terminates the command only when it is exactly
    /// `<marker><integer>`; a marker followed by anything else is output.
    fn parse_marker_line(&self, line: &[u8]) -> Option<i32> {
        let text = std::str::from_utf8(line).ok()?;
        let rest = text.strip_prefix(&self.marker)?;
        rest.trim_end_matches(['\n', '\r']).parse::<i32>().ok()
    }

    async fn recover_from_timeout(
        &mut self,
        started: Instant,
        mut output: Vec<u8>,
        pending: Vec<u8>,
    ) -> Result<ExecResult, EnvError> {
        debug!(elapsed = ?started.elapsed(), "command timed out, interrupting");
        self.interrupt();

        // Cooperative path: give the foreground group a grace period to die
        // and the shell to print the sentinel.  If the marker shows up the
        // shell survived and no rebuild is needed.
        let deadline = Instant::now() + self.options.kill_grace;
        let mut drained = pending;
        let mut chunk = [0u8; 8192];
        let mut shell_alive = false;
        'drain: while let Some(window) = deadline.checked_duration_since(Instant::now()) {
            match tokio::time::timeout(window, self.stdout.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => {
                    drained.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = drained.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = drained.drain(..=pos).collect();
                        if self.parse_marker_line(&line).is_some() {
                            shell_alive = true;
                            break 'drain;
                        }
                        output.extend_from_slice(&line);
                    }
                }
                _ => break,
            }
        }
        output.extend_from_slice(&drained);

        if !shell_alive {
            warn!("shell unresponsive after interrupt, rebuilding session");
            self.rebuild().await?;
        }

        Ok(ExecResult {
            stdout: self.cap_output(output),
            exit_code: -1,
            duration: started.elapsed(),
            timed_out: true,
        })
    }

    /// Register a command replayed into the session whenever the shell is
    /// rebuilt (rc sourcing added after tool install).
    pub fn add_init_command(&mut self, command: String) {
        self.init_commands.push(command);
    }

    /// A detached handle that can interrupt the current foreground group
    /// while an `exec` future holds the session borrow.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            pid: self.child.id(),
        }
    }

    /// Send SIGINT to the shell's process group for cooperative cancellation.
    pub fn interrupt(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // The shell was started in its own session (setsid), so its pid
            // is the process-group id covering any foreground children.
            unsafe {
                libc::killpg(pid as i32, libc::SIGINT);
            }
        }
    }

    /// Kill the current shell and bring up a fresh one with the same spawn
    /// recipe and init commands.
    async fn rebuild(&mut self) -> Result<(), EnvError> {
        self.kill_process_group();
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;

        let (child, stdin, stdout) = spawn_shell(&self.spawn)?;
        self.child = child;
        self.stdin = stdin;
        self.stdout = stdout;
        Box::pin(self.initialize()).await
    }

    fn kill_process_group(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::killpg(pid as i32, libc::SIGKILL);
            }
        }
    }

    /// Best-effort shutdown of the shell process.
    pub async fn close(mut self) {
        let _ = self.stdin.write_all(b"exit\n").await;
        let _ = self.stdin.flush().await;
        let waited =
            tokio::time::timeout(Duration::from_millis(500), self.child.wait()).await;
        if waited.is_err() {
            self.kill_process_group();
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }

    /// Truncate to the configured cap with a notice.  Idempotent: a capped
    /// output plus notice never exceeds the cap a second time.
    fn cap_output(&self, bytes: Vec<u8>) -> String {
        let cap = self.options.output_cap_bytes;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if text.len() <= cap {
            return text;
        }
        let omitted = text.len() - cap;
        let mut end = cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!(
            "{}\n<output truncated: {omitted} bytes omitted>",
            &text[..end]
        )
    }
}

/// Cloneable interrupt capability for cooperative cancellation from outside
/// the session borrow.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    pid: Option<u32>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::killpg(pid as i32, libc::SIGINT);
            }
        }
    }
}

fn spawn_shell(spawn: &ShellSpawn) -> Result<(Child, ChildStdin, ChildStdout), EnvError> {
    let mut cmd = Command::new(&spawn.program);
    cmd.args(&spawn.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(cwd) = &spawn.cwd {
        cmd.current_dir(cwd);
    }
    // A fresh session detaches the shell from any controlling terminal and
    // makes its pid the process-group id, so interrupt/kill reach every
    // foreground child.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| EnvError::Unreachable(format!("spawning {}: {e}", spawn.program)))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| EnvError::Unreachable("shell stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EnvError::Unreachable("shell stdout unavailable".into()))?;
    Ok((child, stdin, stdout))
}

fn humantime_secs(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
