//! External process runner
//!
//! Starts an executable, streams its stdout/stderr line by line into
//! `tracing`, optionally hands every line to a callback, and publishes the
//! final exit state through a watch channel so callers can either poll
//! (`is_done`) or block (`wait`).

use crate::error::{CloudError, Result};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Per-line hook, called from the reader tasks
pub type LineCallback = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// Description of a process to start
#[derive(Clone)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<String>,
    dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    on_line: Option<LineCallback>,
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("dir", &self.dir)
            .field("envs", &self.envs.len())
            .finish()
    }
}

impl ProcessSpec {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            dir: None,
            envs: Vec::new(),
            on_line: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.envs
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn on_line(mut self, callback: LineCallback) -> Self {
        self.on_line = Some(callback);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Short name used to tag log lines
    fn display_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or_else(|| OsStr::new("process"))
            .to_string_lossy()
            .into_owned()
    }

    /// Start the process and return immediately
    ///
    /// Fails synchronously when the executable cannot be started. A
    /// non-zero exit is reported through [`ProcessExit`], not as an error.
    pub fn spawn(self) -> Result<ProcessHandle> {
        let name = self.display_name();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(program = %name, args = ?self.args, "Starting process");

        let mut child = cmd.spawn().map_err(|source| CloudError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        let pid = child.id();

        let capture = Arc::new(Mutex::new(Capture::default()));
        let stdout_task = child.stdout.take().map(|pipe| {
            tokio::spawn(read_lines(
                pipe,
                OutputStream::Stdout,
                name.clone(),
                self.on_line.clone(),
                capture.clone(),
            ))
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            tokio::spawn(read_lines(
                pipe,
                OutputStream::Stderr,
                name.clone(),
                self.on_line.clone(),
                capture.clone(),
            ))
        });

        let (done_tx, done_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let supervisor_name = name.clone();
        tokio::spawn(async move {
            let kill_requested = async {
                if kill_rx.await.is_err() {
                    // Handle dropped without asking for a kill
                    std::future::pending::<()>().await;
                }
            };

            let mut killed = false;
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = kill_requested => {
                    killed = true;
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
            };

            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            let code = status.and_then(|s| s.code());
            debug!(program = %supervisor_name, code = ?code, killed, "Process finished");

            let captured = match capture.lock() {
                Ok(mut guard) => std::mem::take(&mut *guard),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            let _ = done_tx.send(Some(ProcessExit {
                code,
                stdout: captured.stdout,
                stderr: captured.stderr,
                output: captured.combined,
                killed,
            }));
        });

        Ok(ProcessHandle {
            program: name,
            pid,
            done: done_rx,
            kill: Mutex::new(Some(kill_tx)),
        })
    }
}

#[derive(Default)]
struct Capture {
    stdout: String,
    stderr: String,
    combined: String,
}

/// Forward a pipe line by line until EOF
///
/// Lines are decoded lossily; invalid UTF-8 never stops the reader. The
/// pipe is drained to the end even after a read error, otherwise the child
/// would die of SIGPIPE on its next write.
async fn read_lines<R>(
    pipe: R,
    stream: OutputStream,
    program: String,
    on_line: Option<LineCallback>,
    capture: Arc<Mutex<Capture>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches('\n').trim_end_matches('\r');
                handle_line(stream, &program, line, on_line.as_ref(), &capture);
            }
            Err(e) => {
                warn!(program = %program, stream = %stream, error = %e, "Failed to read process output, discarding the rest");
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    warn!(program = %program, stream = %stream, error = %e, "Failed to drain process output");
                }
                break;
            }
        }
    }
}

fn handle_line(
    stream: OutputStream,
    program: &str,
    line: &str,
    on_line: Option<&LineCallback>,
    capture: &Mutex<Capture>,
) {
    debug!(program = %program, stream = %stream, "{}", line);
    if let Some(callback) = on_line {
        callback(stream, line);
    }
    if let Ok(mut capture) = capture.lock() {
        let target = match stream {
            OutputStream::Stdout => &mut capture.stdout,
            OutputStream::Stderr => &mut capture.stderr,
        };
        target.push_str(line);
        target.push('\n');
        capture.combined.push_str(line);
        capture.combined.push('\n');
    }
}

/// Final state of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr interleaved in arrival order
    pub output: String,
    /// Whether the process was stopped through [`ProcessHandle::kill`]
    pub killed: bool,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code with signal deaths mapped to -1
    pub fn code_or_signal(&self) -> i32 {
        self.code.unwrap_or(-1)
    }

    /// Text worth showing to an operator when the process failed
    pub fn diagnostic(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        }
    }
}

/// Handle to a running (or finished) process
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    done: watch::Receiver<Option<ProcessExit>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking completion check
    pub fn is_done(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Exit state if the process has finished
    pub fn exit(&self) -> Option<ProcessExit> {
        self.done.borrow().clone()
    }

    /// Wait until the process has exited and its pipes are drained
    pub async fn wait(&self) -> Result<ProcessExit> {
        let mut done = self.done.clone();
        let exit = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CloudError::ProcessLost(self.program.clone()))?;
        exit.clone()
            .ok_or_else(|| CloudError::ProcessLost(self.program.clone()))
    }

    /// Ask the supervisor to kill the process; no-op once finished
    pub fn kill(&self) {
        let sender = match self.kill.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            debug!(program = %self.program, pid = ?self.pid, "Killing process");
            let _ = sender.send(());
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let handle = sh("echo out-1; echo err-1 >&2; echo out-2").spawn().unwrap();
        let exit = handle.wait().await.unwrap();

        assert!(exit.success());
        assert_eq!(exit.stdout, "out-1\nout-2\n");
        assert_eq!(exit.stderr, "err-1\n");
        assert!(exit.output.contains("out-1"));
        assert!(exit.output.contains("err-1"));
        assert!(handle.is_done());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let handle = sh("echo changes >&2; exit 2").spawn().unwrap();
        let exit = handle.wait().await.unwrap();

        assert_eq!(exit.code, Some(2));
        assert!(!exit.success());
        assert_eq!(exit.diagnostic(), "changes");
    }

    #[tokio::test]
    async fn test_line_callback_sees_every_line() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = sh("echo first; echo marker >&2; echo last")
            .on_line(Arc::new(move |stream, line| {
                sink.lock().unwrap().push((stream, line.to_string()));
            }))
            .spawn()
            .unwrap();
        handle.wait().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&(OutputStream::Stderr, "marker".to_string())));
        assert!(seen.contains(&(OutputStream::Stdout, "last".to_string())));
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_the_reader() {
        // enough output after the bad line to fill the pipe buffer
        let handle = sh("printf '\\377\\376 bad\\n'; \
             yes 'provider diagnostics after the bad line' | head -n 20000; \
             echo done")
        .spawn()
        .unwrap();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(10), handle.wait())
            .await
            .expect("process should finish")
            .unwrap();

        assert_eq!(exit.code, Some(0));
        assert!(exit.stdout.starts_with("\u{FFFD}\u{FFFD} bad\n"));
        assert!(exit.stdout.ends_with("done\n"));
        assert_eq!(exit.stdout.lines().count(), 20002);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_synchronously() {
        let result = ProcessSpec::new("/nonexistent/terraflow-tool").spawn();
        assert!(matches!(result, Err(CloudError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_env_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let handle = sh("echo \"$GREETING\" > greeting.txt")
            .current_dir(dir.path())
            .env("GREETING", "hello")
            .spawn()
            .unwrap();
        handle.wait().await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("greeting.txt")).unwrap();
        assert_eq!(content, "hello\n");
    }

    #[tokio::test]
    async fn test_kill_stops_long_running_process() {
        let handle = sh("exec sleep 30").spawn().unwrap();
        assert!(!handle.is_done());

        handle.kill();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(5), handle.wait())
            .await
            .expect("process should exit after kill")
            .unwrap();
        assert!(exit.killed);
        assert!(!exit.success());
        assert_eq!(exit.code_or_signal(), -1);
    }
}
