//! Launching external commands, synchronously or detached.
//!
//! Every stage action and every cluster count query goes through a
//! [`ProcessRunner`]. The shell implementation runs `sh -c <command>`; tests
//! substitute scripted runners that never spawn anything.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Options for one command invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Block until the child exits. When false the child is detached and the
    /// exit code only reflects whether it could be started.
    pub wait: bool,
    /// Log the command line before executing it.
    pub echo_command: bool,
    /// Collect (and tee) stdout; discarded otherwise.
    pub capture_stdout: bool,
    /// Collect (and tee) stderr; discarded otherwise.
    pub capture_stderr: bool,
    /// Working directory for the child. Inherits ours when `None`.
    pub workdir: Option<PathBuf>,
    /// Append child output to this file as it arrives.
    pub stream_path: Option<PathBuf>,
    /// Kill a waited-on child after this long. Ignored for detached children.
    pub timeout: Option<Duration>,
    /// Bytes of stdout/stderr kept in memory (the pipe is still drained).
    pub output_limit_bytes: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wait: true,
            echo_command: false,
            capture_stdout: true,
            capture_stderr: true,
            workdir: None,
            stream_path: None,
            timeout: None,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl RunOptions {
    /// The same options, fire-and-forget.
    pub fn detach(self) -> Self {
        Self {
            wait: false,
            capture_stdout: false,
            capture_stderr: false,
            ..self
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// The child was detached; `exit_code` only reports submission.
    pub detached: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Output of a successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Abstraction over command execution backends.
pub trait ProcessRunner {
    /// Run `command`. A non-zero exit code is reported, not raised; `Err` means
    /// the command could not be started at all.
    fn run(&self, command: &str, opts: &RunOptions) -> Result<RunOutput>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

type SharedStream = Arc<Option<Mutex<BufWriter<File>>>>;

impl ProcessRunner for ShellRunner {
    #[instrument(skip_all, fields(wait = opts.wait, streaming = opts.stream_path.is_some()))]
    fn run(&self, command: &str, opts: &RunOptions) -> Result<RunOutput> {
        let stream = open_stream(opts.stream_path.as_deref())?;
        if opts.echo_command {
            info!(command, "executing");
            tee_line(&stream, format!("$ {command}\n").as_bytes());
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).stdin(Stdio::null());
        if let Some(dir) = &opts.workdir {
            cmd.current_dir(dir);
        }

        if !opts.wait {
            return spawn_detached(cmd, command, opts);
        }

        cmd.stdout(if opts.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if opts.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        debug!("spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn `{command}`"));
            }
        };

        let limit = opts.output_limit_bytes;
        let stdout_handle = child.stdout.take().map(|out| {
            let stream = Arc::clone(&stream);
            thread::spawn(move || read_lines_with_tee(out, limit, "stdout", stream))
        });
        let stderr_handle = child.stderr.take().map(|err| {
            let stream = Arc::clone(&stream);
            thread::spawn(move || read_lines_with_tee(err, limit, "stderr", stream))
        });

        let (status, timed_out) = wait_child(&mut child, opts.timeout)?;

        let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
        let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }

        let exit_code = exit_code_of(status);
        debug!(exit_code, timed_out, "command finished");
        Ok(RunOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            stdout_truncated,
            stderr_truncated,
            timed_out,
            detached: false,
        })
    }
}

fn wait_child(child: &mut Child, timeout: Option<Duration>) -> Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return Ok((child.wait().context("wait for command")?, false));
    };
    match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Ok((status, false)),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            Ok((child.wait().context("wait command after kill")?, true))
        }
    }
}

/// Start the child and hand it to a reaper thread. Output goes to the stream
/// file when one is configured, otherwise nowhere.
fn spawn_detached(mut cmd: Command, command: &str, opts: &RunOptions) -> Result<RunOutput> {
    match &opts.stream_path {
        Some(path) => {
            let out = append_file(path)?;
            let err = out
                .try_clone()
                .with_context(|| format!("clone stream file {}", path.display()))?;
            cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to submit detached command");
            return Err(e).with_context(|| format!("spawn detached `{command}`"));
        }
    };
    let pid = child.id();
    debug!(pid, "detached child started");
    thread::spawn(move || {
        if let Err(e) = child.wait() {
            warn!(pid, err = %e, "failed to reap detached child");
        }
    });

    Ok(RunOutput {
        detached: true,
        ..RunOutput::default()
    })
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn open_stream(path: Option<&Path>) -> Result<SharedStream> {
    let writer = match path {
        Some(path) => Some(Mutex::new(BufWriter::new(append_file(path)?))),
        None => None,
    };
    Ok(Arc::new(writer))
}

fn append_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open stream file {}", path.display()))
}

fn tee_line(stream: &SharedStream, line: &[u8]) {
    if let Some(ref mutex) = **stream
        && let Ok(mut writer) = mutex.lock()
    {
        // Flush per line so the file can be tailed while the child runs.
        if let Err(e) = writer.write_all(line) {
            warn!(err = %e, "failed to write to stream file");
        } else if let Err(e) = writer.flush() {
            warn!(err = %e, "failed to flush stream file");
        }
    }
}

fn join_output(
    handle: Option<thread::JoinHandle<Result<(Vec<u8>, usize)>>>,
) -> Result<(Vec<u8>, usize)> {
    let Some(handle) = handle else {
        return Ok((Vec::new(), 0));
    };
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, tee-ing each line to tracing
/// and to the stream file.
fn read_lines_with_tee<R: Read>(
    reader: R,
    limit: usize,
    label: &'static str,
    stream: SharedStream,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        debug!(
            target: "stagepipe::child",
            stream = label,
            "{}",
            String::from_utf8_lossy(&line).trim_end()
        );
        tee_line(&stream, &line);

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}
