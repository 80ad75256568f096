//! Helpers for running child processes with timeouts and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long to wait for output readers once the child has exited.
///
/// Descendants that inherited the pipes can keep them open after the child is
/// gone; output read up to this point is returned and the readers are detached.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Limits applied to every child process the step spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory per stream.
    pub output_limit_bytes: usize,
}

/// Program plus leading arguments used to start an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    program: String,
    leading: Vec<String>,
}

impl Launcher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading: Vec::new(),
        }
    }

    /// Arguments placed before every invocation's own arguments.
    pub fn with_leading_args(mut self, leading: Vec<String>) -> Self {
        self.leading = leading;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading);
        cmd
    }
}

/// External tools the step invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub xcodebuild: Launcher,
    pub tuist: Launcher,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            xcodebuild: Launcher::new("xcodebuild"),
            tuist: Launcher::new("tuist"),
        }
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout followed by stderr, lossily decoded, with truncation notices.
    pub fn combined(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        buf
    }

    /// Turn a non-successful run into an error that carries the combined output.
    pub fn into_result(self, label: &str) -> Result<Self> {
        if self.timed_out {
            return Err(anyhow!("{label} timed out\n{}", self.combined()));
        }
        if !self.status.success() {
            return Err(anyhow!(
                "{label} failed with status {:?}\n{}",
                self.status.code(),
                self.combined()
            ));
        }
        Ok(self)
    }
}

/// Render a command the way it would be typed in a shell (for log lines).
pub fn display_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|arg| {
        let arg = arg.to_string_lossy();
        if arg.contains(' ') {
            format!("\"{arg}\"")
        } else {
            arg.into_owned()
        }
    }));
    parts.join(" ")
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs; bytes beyond
/// `limits.output_limit_bytes` are discarded while the pipe is still drained.
/// When `log_path` is set every stdout line is also written to that file as it
/// arrives, so long builds leave a log even if they are killed.
///
/// On unix the child leads its own process group and a timeout kills the whole
/// group. Readers get [`READER_GRACE`] after the child exits; output still in
/// flight after that is dropped.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), logging = log_path.is_some()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
    log_path: Option<&Path>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let log_file = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create log file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    // Own process group, so a timeout takes down everything the child started.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

    debug!(command = %display_command(&cmd), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {}", display_command(&cmd)));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let (done_tx, done_rx) = mpsc::channel();
    {
        let capture = stdout_capture.clone();
        let done = done_tx.clone();
        thread::spawn(move || {
            if let Err(err) = read_lines_limited(stdout, limit, log_file, &capture) {
                warn!("read stdout: {err:#}");
            }
            let _ = done.send(());
        });
    }
    {
        let capture = stderr_capture.clone();
        thread::spawn(move || {
            if let Err(err) = read_stream_limited(stderr, limit, &capture) {
                warn!("read stderr: {err:#}");
            }
            let _ = done_tx.send(());
        });
    }

    // Feed stdin after the readers are running so a chatty child cannot block us.
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "child closed stdin early");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(limits.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    if !wait_for_readers(&done_rx, 2, READER_GRACE) {
        warn!(
            grace_secs = READER_GRACE.as_secs(),
            "output pipes still open after exit, keeping output read so far"
        );
    }
    let (stdout, stdout_truncated) = stdout_capture.snapshot();
    let (stderr, stderr_truncated) = stderr_capture.snapshot();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Output collected by a reader thread, readable while the thread still runs.
#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

#[derive(Clone, Default)]
struct SharedCapture(Arc<Mutex<Captured>>);

impl SharedCapture {
    fn push(&self, chunk: &[u8], limit: usize) {
        let mut captured = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = chunk.len().min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += chunk.len() - keep;
    }

    fn snapshot(&self) -> (Vec<u8>, usize) {
        let captured = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        (captured.bytes.clone(), captured.truncated)
    }
}

/// Kill the child and, on unix, every process in its group.
fn kill_tree(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill").args(["-KILL", "--", &group]).status() {
            Ok(status) if status.success() => {}
            Ok(status) => debug!(exit_code = ?status.code(), "process group kill failed"),
            Err(err) => debug!(err = %err, "process group kill failed"),
        }
    }
    match child.kill() {
        Ok(()) => Ok(()),
        // Already reaped by the group kill.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Wait until `readers` threads reported completion or `grace` elapsed.
fn wait_for_readers(done: &Receiver<()>, readers: usize, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    for _ in 0..readers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if done.recv_timeout(remaining).is_err() {
            return false;
        }
    }
    true
}

/// Read a stream line by line with a size limit, optionally copying each line to a log.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    mut log: Option<BufWriter<File>>,
    capture: &SharedCapture,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(writer) = log.as_mut()
            && let Err(e) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %e, "failed to write command log, disabling");
            log = None;
        }

        capture.push(&line, limit);
    }

    Ok(())
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, capture: &SharedCapture) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        capture.push(&chunk[..n], limit);
    }

    Ok(())
}
