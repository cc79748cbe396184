//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// How often a running child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long output readers may lag behind the child before whatever still
/// holds the pipes is killed, and again before the readers are abandoned.
const READER_GRACE: Duration = Duration::from_secs(2);

type ReaderHandle = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
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

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// When `cancel` fires the child is killed and the output is returned with `cancelled = true`.
///
/// On unix the child leads its own process group, and timeout or cancellation kills the whole
/// group so wrapper scripts cannot leave their workers running. Processes that still hold the
/// output pipes a short while after the child exits are killed the same way.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
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

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    // Written on its own thread so a child that never reads cannot stall the deadline.
    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    warn!(err = %e, "child closed stdin early");
                }
            }))
        }
        None => None,
    };

    let pgid = child.id();
    let (status, timed_out, cancelled) = wait_with_deadline(&mut child, timeout, cancel)?;

    if !readers_finished(&stdout_handle, &stderr_handle, READER_GRACE) {
        warn!(pgid, "output pipes still open after exit, killing process group");
        kill_process_group(pgid);
        readers_finished(&stdout_handle, &stderr_handle, READER_GRACE);
    }
    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle, "stdout").context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle, "stderr").context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

/// Wait for the child in short slices so cancellation is noticed promptly.
///
/// Returns `(status, timed_out, cancelled)`.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<(ExitStatus, bool, bool)> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            let status = kill_and_wait(child)?;
            return Ok((status, true, false));
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            return Ok((status, false, false));
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("cancellation requested, killing command");
            let status = kill_and_wait(child)?;
            return Ok((status, false, true));
        }
    }
}

fn kill_and_wait(child: &mut Child) -> Result<ExitStatus> {
    kill_process_group(child.id());
    if let Err(e) = child.kill() {
        debug!(err = %e, "child already gone");
    }
    child.wait().context("wait command after kill")
}

/// SIGKILL every process in the group led by `pgid`.
#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let result = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match result {
        Ok(status) if status.success() => debug!(pgid, "killed process group"),
        Ok(status) => debug!(pgid, code = ?status.code(), "process group already gone"),
        Err(e) => warn!(err = %e, pgid, "failed to signal process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Poll until both readers reach EOF or `grace` elapses.
fn readers_finished(stdout: &ReaderHandle, stderr: &ReaderHandle, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if stdout.is_finished() && stderr.is_finished() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Join a finished reader; a reader still blocked on a pipe is detached and yields nothing.
fn join_output(handle: ReaderHandle, stream: &str) -> Result<(Vec<u8>, usize)> {
    if !handle.is_finished() {
        warn!(stream, "abandoning output reader blocked on a leftover process");
        return Ok((Vec::new(), 0));
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let output = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(5),
            1024,
            None,
        )
        .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout_lossy(), "out\n");
        assert_eq!(output.stderr_lossy(), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let output =
            run_command_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(5), 1024, None)
                .expect("run");
        assert_eq!(output.stdout_lossy(), "hello");
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let output = run_command_with_timeout(
            sh("printf 'abcdef'"),
            None,
            Duration::from_secs(5),
            4,
            None,
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 2);
        assert!(
            output
                .stdout_truncated_notice("runner")
                .contains("truncated 2 bytes")
        );
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_command_with_timeout(
            sh("exec sleep 5"),
            None,
            Duration::from_millis(200),
            1024,
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.cancelled);
    }

    #[test]
    fn kills_when_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("exec sleep 5"),
            None,
            Duration::from_secs(10),
            1024,
            Some(&token),
        )
        .expect("run");
        assert!(output.cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_kills_grandchildren_of_a_wrapper_shell() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("survived");
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh(&format!("sleep 3; echo x > '{}'; echo x", marker.display())),
            None,
            Duration::from_millis(300),
            1024,
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());

        thread::sleep(Duration::from_secs(4).saturating_sub(started.elapsed()));
        assert!(!marker.exists(), "grandchild outlived the timeout");
    }

    #[test]
    fn cancel_kills_grandchildren_of_a_wrapper_shell() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 5; echo x"),
            None,
            Duration::from_secs(30),
            1024,
            Some(&token),
        )
        .expect("run");
        canceller.join().expect("canceller");
        assert!(output.cancelled);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(output.stdout.is_empty());
    }

    #[test]
    fn background_process_holding_pipes_does_not_stall() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30 & echo done"),
            None,
            Duration::from_secs(60),
            1024,
            None,
        )
        .expect("run");
        assert!(output.status.success());
        assert!(!output.timed_out);
        assert_eq!(output.stdout_lossy(), "done\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command_with_timeout(
            Command::new("definitely-not-a-real-binary-uiexec"),
            None,
            Duration::from_secs(1),
            1024,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
