//! External tool invocation
//!
//! Every compiler, dexer, packager and signer is a black box reached through
//! [`ProcessRunner::run`]: an executable, an ordered argument list and an
//! environment map go in, an exit code and captured output come out.
//!
//! Running processes observe a [`CancellationToken`] and an optional timeout.
//! Either one terminates the child (SIGTERM, grace period, then SIGKILL) so no
//! tool outlives the build that started it.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::cancel::CancellationToken;

/// Flags whose following argument is a secret and must not be logged.
const SECRET_FLAGS: &[&str] = &[
    "-storepass",
    "-keypass",
    "-srcstorepass",
    "-deststorepass",
    "--ks-pass",
    "--key-pass",
];

/// Placeholder printed instead of secret values.
pub const REDACTED: &str = "******";

/// Errors from process execution.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while running {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} timed out after {after:?}")]
    TimedOut { tool: String, after: Duration },

    #[error("{tool} was cancelled")]
    Cancelled { tool: String },

    #[error("{tool} exited with {status}: {stderr}")]
    NonZeroExit {
        tool: String,
        status: String,
        stderr: String,
    },
}

impl ProcessError {
    /// True when the process was stopped by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled { .. })
    }
}

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives tool output line by line while the process runs.
pub trait OutputHandler: Send + Sync {
    fn line(&self, tool: &str, stream: OutputStream, line: &str);
}

/// Description of one process invocation.
#[derive(Clone, Default)]
pub struct ProcessInfo {
    executable: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    description: Option<String>,
}

impl ProcessInfo {
    /// Start describing an invocation of `executable`.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a path argument.
    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable; the value is converted with `to_string`.
    pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.env.insert(key.into(), value.to_string());
        self
    }

    /// Run the process in `dir`.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Short name used in logs and errors instead of the executable path.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Tool name for messages.
    pub fn tool_name(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.display().to_string())
    }

    /// Command line safe for logs.
    ///
    /// Environment values are never included, and the argument after any
    /// password flag is masked.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.executable.display().to_string()];
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                mask_next = false;
                // `env:NAME` and `file:PATH` are references, not secrets
                if !arg.starts_with("env:") && !arg.starts_with("file:") {
                    parts.push(REDACTED.to_string());
                    continue;
                }
            }
            let flag = arg.split(':').next().unwrap_or(arg);
            // `-storepass:env NAME` names a variable, not a secret
            mask_next = SECRET_FLAGS.contains(&flag) && !arg.contains(':');
            parts.push(quote(arg));
        }
        parts.join(" ")
    }
}

impl fmt::Debug for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInfo")
            .field("command", &self.command_line())
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.contains(char::is_whitespace) {
        format!("'{}'", arg.replace('\'', "'\\''"))
    } else {
        arg.to_string()
    }
}

/// Outcome of a completed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    tool: String,
    exit_code: Option<i32>,
    signal: Option<i32>,
    stdout: String,
    stderr: String,
    duration: Duration,
}

impl ProcessResult {
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Exit code, `None` if the process was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Terminating signal on unix.
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into [`ProcessError::NonZeroExit`].
    pub fn assert_normal_exit(self) -> Result<Self, ProcessError> {
        if self.success() {
            return Ok(self);
        }
        let status = match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown status".to_string(),
        };
        let stderr = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(ProcessError::NonZeroExit {
            tool: self.tool,
            status,
            stderr,
        })
    }
}

/// Runner settings.
#[derive(Debug, Clone, Copy)]
pub struct ProcessRunnerConfig {
    /// Kill processes that run longer than this.
    pub timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL.
    pub termination_grace: Duration,
    /// How often the child is polled for exit, cancellation and timeout.
    pub poll_interval: Duration,
}

impl Default for ProcessRunnerConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            termination_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Runs external tools and captures their output.
#[derive(Clone, Default)]
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
    handler: Option<Arc<dyn OutputHandler>>,
}

impl ProcessRunner {
    pub fn new(config: ProcessRunnerConfig) -> Self {
        Self {
            config,
            handler: None,
        }
    }

    /// Forward every output line to `handler` while the process runs.
    pub fn with_output_handler(mut self, handler: Arc<dyn OutputHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn config(&self) -> &ProcessRunnerConfig {
        &self.config
    }

    /// Run a process to completion.
    ///
    /// A non-zero exit is not an error here; see
    /// [`ProcessResult::assert_normal_exit`].
    pub fn run(
        &self,
        info: &ProcessInfo,
        token: &CancellationToken,
    ) -> Result<ProcessResult, ProcessError> {
        let tool = info.tool_name();
        if token.is_cancelled() {
            return Err(ProcessError::Cancelled { tool });
        }

        tracing::debug!(tool = %tool, command = %info.command_line(), "running tool");

        let mut command = Command::new(&info.executable);
        command
            .args(&info.args)
            .envs(&info.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &info.working_dir {
            command.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            tool: tool.clone(),
            source,
        })?;

        let stdout = self.capture(&tool, OutputStream::Stdout, child.stdout.take());
        let stderr = self.capture(&tool, OutputStream::Stderr, child.stderr.take());

        // On cancellation or timeout the capture threads are left to finish on
        // their own; a grandchild may still hold the pipes open.
        let status = self.wait(&tool, &mut child, token, start)?;
        let stdout = join_capture(stdout);
        let stderr = join_capture(stderr);

        let result = ProcessResult {
            tool,
            exit_code: status.code(),
            signal: exit_signal(&status),
            stdout,
            stderr,
            duration: start.elapsed(),
        };
        tracing::debug!(
            tool = %result.tool,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "tool finished"
        );
        Ok(result)
    }

    fn capture<R>(
        &self,
        tool: &str,
        stream: OutputStream,
        pipe: Option<R>,
    ) -> Option<JoinHandle<String>>
    where
        R: Read + Send + 'static,
    {
        let pipe = pipe?;
        let handler = self.handler.clone();
        let tool = tool.to_string();
        Some(thread::spawn(move || {
            let mut captured = String::new();
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            // Drain to EOF; a closed pipe kills the tool with SIGPIPE
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!(tool = %tool, error = %e, "failed to read tool output");
                        break;
                    }
                }
                let raw = buf.strip_suffix(b"\n").unwrap_or(&buf);
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                let line = String::from_utf8_lossy(raw);
                if let Some(handler) = &handler {
                    handler.line(&tool, stream, &line);
                }
                captured.push_str(&line);
                captured.push('\n');
            }
            captured
        }))
    }

    /// Wait for exit while watching cancellation and the timeout.
    fn wait(
        &self,
        tool: &str,
        child: &mut Child,
        token: &CancellationToken,
        start: Instant,
    ) -> Result<ExitStatus, ProcessError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    self.terminate(child);
                    return Err(ProcessError::Io {
                        tool: tool.to_string(),
                        source,
                    });
                }
            }

            if token.is_cancelled() {
                tracing::info!(tool, "terminating tool after cancellation");
                self.terminate(child);
                return Err(ProcessError::Cancelled {
                    tool: tool.to_string(),
                });
            }

            if let Some(timeout) = self.config.timeout {
                if start.elapsed() >= timeout {
                    tracing::warn!(tool, timeout_s = timeout.as_secs(), "tool timed out");
                    self.terminate(child);
                    return Err(ProcessError::TimedOut {
                        tool: tool.to_string(),
                        after: timeout,
                    });
                }
            }

            thread::sleep(self.config.poll_interval);
        }
    }

    /// Terminate a child gracefully, then forcefully.
    fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(child.id() as i32);
            let _ = signal::kill(pid, Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let start = Instant::now();
        while start.elapsed() < self.config.termination_grace {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(self.config.poll_interval),
                Err(_) => break,
            }
        }

        let _ = child.kill();
        let _ = child.wait();
    }
}

fn join_capture(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_command_line_masks_literal_passwords() {
        let info = ProcessInfo::new("/usr/bin/keytool")
            .args(["-list", "-storepass", "hunter2", "-alias", "key0"]);
        let line = info.command_line();
        assert!(!line.contains("hunter2"));
        assert!(line.contains(REDACTED));
        assert!(line.contains("-alias key0"));
    }

    #[test]
    fn test_command_line_keeps_apksigner_env_refs() {
        let info = ProcessInfo::new("apksigner").args(["--ks-pass", "env:KS_PASS"]);
        assert!(info.command_line().ends_with("--ks-pass env:KS_PASS"));
    }

    #[test]
    fn test_command_line_keeps_env_references() {
        let info = ProcessInfo::new("keytool")
            .args(["-storepass:env", "STORE_PASS", "-keystore", "debug.keystore"])
            .env("STORE_PASS", "android");
        let line = info.command_line();
        assert!(line.contains("-storepass:env STORE_PASS"));
        assert!(!line.contains("android"));
    }

    #[test]
    fn test_debug_hides_env_values() {
        let info = ProcessInfo::new("apksigner").env("KS_PASS", "s3cret");
        let debug = format!("{:?}", info);
        assert!(debug.contains("KS_PASS"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_quote_whitespace_args() {
        let info = ProcessInfo::new("keytool").arg("CN=Android Debug,O=Android,C=US");
        assert!(info.command_line().ends_with("'CN=Android Debug,O=Android,C=US'"));
    }

    #[test]
    fn test_tool_name_prefers_description() {
        let info = ProcessInfo::new("/opt/sdk/build-tools/aapt");
        assert_eq!(info.tool_name(), "aapt");
        assert_eq!(info.describe("aapt package").tool_name(), "aapt package");
    }

    #[test]
    fn test_assert_normal_exit_uses_stderr() {
        let result = ProcessResult {
            tool: "javac".to_string(),
            exit_code: Some(1),
            signal: None,
            stdout: String::new(),
            stderr: "Main.java:3: error: ';' expected\n".to_string(),
            duration: Duration::ZERO,
        };
        match result.assert_normal_exit() {
            Err(ProcessError::NonZeroExit { tool, status, stderr }) => {
                assert_eq!(tool, "javac");
                assert_eq!(status, "exit code 1");
                assert!(stderr.contains("';' expected"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_spawn_failure_is_typed() {
        let runner = ProcessRunner::default();
        let info = ProcessInfo::new("/nonexistent/tool/for/apkforge");
        let err = runner.run(&info, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn test_cancelled_before_start() {
        let runner = ProcessRunner::default();
        let token = CancellationToken::new();
        token.cancel();
        let err = runner.run(&ProcessInfo::new("true"), &token).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn test_captures_output_and_env() {
        let runner = ProcessRunner::default();
        let info = ProcessInfo::new("/bin/sh")
            .args(["-c", "echo out-$APKFORGE_TEST; echo err >&2; exit 3"])
            .env("APKFORGE_TEST", 42);
        let result = runner.run(&info, &CancellationToken::new()).unwrap();

        assert_eq!(result.exit_code(), Some(3));
        assert_eq!(result.stdout(), "out-42\n");
        assert_eq!(result.stderr(), "err\n");
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_output_keeps_reading() {
        let runner = ProcessRunner::default();
        let info = ProcessInfo::new("/bin/sh").args([
            "-c",
            "printf 'caf\\351\\n'; i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done; echo done >&2; exit 0",
        ]);
        let result = runner.run(&info, &CancellationToken::new()).unwrap();

        assert!(result.success(), "signal: {:?}", result.signal());
        let stdout = result.stdout();
        assert!(stdout.starts_with("caf\u{FFFD}\n"));
        assert!(stdout.contains("line-0\n"));
        assert!(stdout.ends_with("line-19999\n"));
        assert_eq!(stdout.lines().count(), 20001);
        assert_eq!(result.stderr(), "done\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_output_handler_sees_lines() {
        struct Collect(Mutex<Vec<(OutputStream, String)>>);
        impl OutputHandler for Collect {
            fn line(&self, _tool: &str, stream: OutputStream, line: &str) {
                self.0.lock().unwrap().push((stream, line.to_string()));
            }
        }

        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        let runner = ProcessRunner::default().with_output_handler(collect.clone());
        let info = ProcessInfo::new("/bin/sh").args(["-c", "echo one; echo two"]);
        runner.run(&info, &CancellationToken::new()).unwrap();

        let lines = collect.0.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                (OutputStream::Stdout, "one".to_string()),
                (OutputStream::Stdout, "two".to_string()),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        let runner = ProcessRunner::new(ProcessRunnerConfig {
            timeout: Some(Duration::from_millis(100)),
            termination_grace: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        });
        let start = Instant::now();
        let err = runner
            .run(
                &ProcessInfo::new("/bin/sh").args(["-c", "exec sleep 30"]),
                &CancellationToken::new(),
            )
            .unwrap_err();

        assert!(matches!(err, ProcessError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_cancellation_kills_running_child() {
        let runner = ProcessRunner::new(ProcessRunnerConfig {
            timeout: None,
            termination_grace: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        });
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                token.cancel();
            })
        };

        let start = Instant::now();
        let err = runner
            .run(&ProcessInfo::new("/bin/sh").args(["-c", "exec sleep 30"]), &token)
            .unwrap_err();
        canceller.join().unwrap();

        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
