//! Bounded execution of external tools (`resolvconf`, `systemctl`, `ip`, ...).
//!
//! Every invocation goes through a [`CommandRunner`] so that detection and the
//! appliers can be driven by a scripted runner in tests.

use crate::error::{NetError, Result};
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Interval between exit checks while waiting on a child.
const WAIT_POLL: Duration = Duration::from_millis(5);

/// A program, its arguments, and optional standard input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Program name, looked up on `PATH`.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Bytes streamed to the child's standard input.
    pub stdin: Option<String>,
}

impl CommandLine {
    /// Creates a command line without standard input.
    #[must_use]
    pub fn new<S: Into<String>>(
        program: impl Into<String>,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    /// Attaches standard input.
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the child was killed by a signal.
    pub code: Option<i32>,
    /// Standard output followed by standard error.
    pub output: String,
}

impl CommandOutput {
    /// Creates an output with the given exit code and text.
    #[must_use]
    pub fn new(code: i32, output: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            output: output.into(),
        }
    }

    /// Returns `true` if the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    /// Runs `cmd` to completion.
    ///
    /// A non-zero exit is not an error at this level; callers decide.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Io`] if the program cannot be started and
    /// [`NetError::Timeout`] if it does not finish in time.
    fn run(&self, cmd: &CommandLine) -> Result<CommandOutput>;

    /// Returns `true` if `program` is an executable on `PATH`.
    fn exists(&self, program: &str) -> bool;
}

/// Runs `cmd` and turns a non-zero exit into [`NetError::Command`].
///
/// # Errors
///
/// Propagates runner failures, and reports unsuccessful exits with the
/// command line and its combined output.
pub fn run_checked(runner: &dyn CommandRunner, cmd: &CommandLine) -> Result<String> {
    let out = runner.run(cmd)?;
    if out.success() {
        Ok(out.output)
    } else {
        Err(NetError::Command {
            command: cmd.to_string(),
            output: out.output.trim().to_string(),
        })
    }
}

/// [`CommandRunner`] backed by real child processes with a deadline.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    /// Creates a runner that kills children still running after `timeout`.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &CommandLine) -> Result<CommandOutput> {
        tracing::debug!(command = %cmd, "Running command");

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let deadline = Instant::now() + self.timeout;

        if let (Some(input), Some(mut stdin)) = (&cmd.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes())?;
        }

        let (tx, rx) = mpsc::channel();
        let mut open = 0;
        if let Some(pipe) = child.stdout.take() {
            drain(STDOUT, pipe, tx.clone());
            open += 1;
        }
        if let Some(pipe) = child.stderr.take() {
            drain(STDERR, pipe, tx.clone());
            open += 1;
        }
        drop(tx);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(
                    command = %cmd,
                    timeout = ?self.timeout,
                    "Command timed out, killed"
                );
                return Err(NetError::Timeout {
                    operation: cmd.to_string(),
                    timeout: self.timeout,
                });
            }
            thread::sleep(WAIT_POLL);
        };

        // A descendant that inherited the pipes can hold them open long after
        // the child exits; collect only until the deadline.
        let mut streams = [Vec::new(), Vec::new()];
        while open > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok((stream, Some(bytes))) => streams[stream].extend_from_slice(&bytes),
                Ok((_, None)) => open -= 1,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    tracing::debug!(
                        command = %cmd,
                        "Output still held open after exit, not waiting"
                    );
                    break;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let [stdout, stderr] = streams;
        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&stderr));

        Ok(CommandOutput {
            code: status.code(),
            output,
        })
    }

    fn exists(&self, program: &str) -> bool {
        if program.contains('/') {
            return is_executable(Path::new(program));
        }
        std::env::var_os("PATH").is_some_and(|paths| {
            std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program)))
        })
    }
}

const STDOUT: usize = 0;
const STDERR: usize = 1;

/// Chunks read from one pipe; `None` marks end of stream.
type Chunk = (usize, Option<Vec<u8>>);

fn drain(stream: usize, mut pipe: impl Read + Send + 'static, tx: mpsc::Sender<Chunk>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((stream, Some(buf[..n].to_vec()))).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        let _ = tx.send((stream, None));
    });
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
