//! Spawning of the external Bluetooth tools.
//!
//! [`ProcessLauncher`] is the seam between the hcidump backend and the OS:
//! [`SystemLauncher`] runs real commands, tests substitute their own.

use futures::future::BoxFuture;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::debug;

/// How long a process gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Readable output of a spawned process.
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Runs commands on behalf of a capture backend.
pub trait ProcessLauncher: Send + Sync {
    /// Run `argv` to completion and return its exit code.
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, io::Result<i32>>;

    /// Start a long-running process. Stdout is captured only when asked for.
    fn spawn(&self, argv: &[String], capture_stdout: bool) -> io::Result<Box<dyn CaptureProcess>>;
}

/// A process spawned by a [`ProcessLauncher`].
pub trait CaptureProcess: Send {
    /// Take the captured stdout. Returns `None` after the first call.
    fn take_stdout(&mut self) -> Option<ProcessOutput>;

    /// Terminate the process and reap it.
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

fn split_argv(argv: &[String]) -> io::Result<(&String, &[String])> {
    argv.split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))
}

/// Launcher backed by `tokio::process`.
///
/// Spawned children get SIGTERM when dropped unreaped, never SIGKILL.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn run<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, io::Result<i32>> {
        Box::pin(async move {
            let (program, args) = split_argv(argv)?;
            let status = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .status()
                .await?;
            // Killed by a signal: report as a generic failure.
            Ok(status.code().unwrap_or(-1))
        })
    }

    fn spawn(&self, argv: &[String], capture_stdout: bool) -> io::Result<Box<dyn CaptureProcess>> {
        let (program, args) = split_argv(argv)?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(if capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::null())
            .spawn()?;

        debug!("Spawned {} (pid {:?})", argv.join(" "), child.id());
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl CaptureProcess for ChildProcess {
    fn take_stdout(&mut self) -> Option<ProcessOutput> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as ProcessOutput)
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            // `id` is None once the child has been reaped.
            let Some(pid) = self.child.id() else {
                return Ok(());
            };

            // sudo relays SIGTERM to the tool it started, but cannot relay
            // SIGKILL, so ask politely first.
            terminate(pid)?;
            match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
                Ok(status) => status.map(|_| ()),
                Err(_) => {
                    debug!("pid {pid} ignored SIGTERM, killing");
                    self.child.kill().await
                }
            }
        })
    }
}

impl Drop for ChildProcess {
    /// Reached when the owning task is cancelled before `close` ran, for
    /// example on runtime shutdown. SIGTERM is the only signal sudo forwards.
    fn drop(&mut self) {
        if let Some(pid) = self.child.id() {
            debug!("Capture process {pid} dropped without close, sending SIGTERM");
            if let Err(e) = terminate(pid) {
                debug!("Failed to signal pid {pid}: {e}");
            }
        }
    }
}

fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // Already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}
