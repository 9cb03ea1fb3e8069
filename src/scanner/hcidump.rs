//! hcitool/hcidump backend.
//!
//! The adapter is reset with `hciconfig`, `hcitool lescan2` keeps the
//! controller scanning, and `hcidump --raw` prints every HCI packet. Only
//! the dump output is read; see [`crate::frame`] for its format.
//!
//! All three tools need root unless the process already holds
//! CAP_NET_RAW and CAP_NET_ADMIN, so they run through `sudo` by default.

use super::process::{CaptureProcess, ProcessLauncher, ProcessOutput, SystemLauncher};
use super::{ScanError, process_device};
use crate::advertisement::Advertisement;
use crate::config::{RetryPolicy, ScanConfig};
use crate::frame::{Framer, parse_frame};
use crate::session::{Blacklist, Capture, CaptureSource};
use crate::stream::{AdvertisementStream, Communication};
use futures::future::BoxFuture;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info, warn};

/// `sudo hciconfig <device> reset`
pub fn reset_command(device: &str, use_sudo: bool) -> Vec<String> {
    command(use_sudo, false, &["hciconfig", device, "reset"])
}

/// `sudo -n hcitool -i <device> lescan2 --duplicates`
pub fn scan_command(device: &str, use_sudo: bool) -> Vec<String> {
    command(use_sudo, true, &["hcitool", "-i", device, "lescan2", "--duplicates"])
}

/// `sudo -n hcidump -i <device> --raw`
pub fn dump_command(device: &str, use_sudo: bool) -> Vec<String> {
    command(use_sudo, true, &["hcidump", "-i", device, "--raw"])
}

fn command(use_sudo: bool, non_interactive: bool, args: &[&str]) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 2);
    if use_sudo {
        argv.push("sudo".to_string());
        if non_interactive {
            argv.push("-n".to_string());
        }
    }
    argv.extend(args.iter().map(|arg| arg.to_string()));
    argv
}

/// Run the reset command until it succeeds or `policy` runs out.
pub async fn reset_adapter(
    launcher: &dyn ProcessLauncher,
    argv: &[String],
    device: &str,
    policy: RetryPolicy,
) -> Result<(), ScanError> {
    info!("FYI: Calling a process: {}", argv.join(" "));

    let mut delays = policy.delays();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let reason = match launcher.run(argv).await {
            Ok(0) => return Ok(()),
            Ok(code) => format!("exit code {code}"),
            Err(e) => e.to_string(),
        };

        let Some(delay) = delays.next() else {
            info!("Problem with hciconfig reset. Exit.");
            return Err(ScanError::AdapterReset {
                device: device.to_string(),
                attempts,
                reason,
            });
        };

        info!("Problem with hciconfig reset ({reason}). Retry reset in {delay:?}.");
        tokio::time::sleep(delay).await;
    }
}

/// Frames reassembled from the lines of a capture process.
pub struct FrameReader<R> {
    lines: Lines<R>,
    framer: Framer,
    eof: bool,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            framer: Framer::new(),
            eof: false,
        }
    }

    /// Read the next complete frame.
    ///
    /// At end of input the frame still being collected is returned first;
    /// after that every call fails with [`ScanError::CaptureEof`].
    ///
    /// Cancel safe: no line is lost if the future is dropped early.
    pub async fn next_frame(&mut self) -> Result<String, ScanError> {
        loop {
            if self.eof {
                return Err(ScanError::CaptureEof);
            }

            match self.lines.next_line().await? {
                Some(line) => {
                    debug!("Read line from hcidump: {line}");
                    if let Some(frame) = self.framer.push_line(&line) {
                        return Ok(frame);
                    }
                }
                None => {
                    self.eof = true;
                    if let Some(frame) = self.framer.finish() {
                        return Ok(frame);
                    }
                }
            }
        }
    }
}

/// The hcitool/hcidump process pair.
pub struct HcidumpCapture {
    scanner: Box<dyn CaptureProcess>,
    dump: Box<dyn CaptureProcess>,
    frames: FrameReader<BufReader<ProcessOutput>>,
    closed: bool,
}

impl Capture for HcidumpCapture {
    fn next(&mut self, idle: Duration) -> BoxFuture<'_, Result<Option<Advertisement>, ScanError>> {
        Box::pin(async move {
            let frame = match tokio::time::timeout(idle, self.frames.next_frame()).await {
                Ok(frame) => frame?,
                Err(_) => return Ok(None),
            };

            match parse_frame(&frame) {
                Ok(advertisement) => {
                    debug!(
                        "MAC: {:?}, data: {}",
                        advertisement.mac, advertisement.payload
                    );
                    Ok(Some(advertisement))
                }
                Err(e) => {
                    debug!("Skipping frame {frame}: {e}");
                    Ok(None)
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return;
            }
            self.closed = true;

            info!("Stop receiving broadcasts");
            for process in [&mut self.scanner, &mut self.dump] {
                if let Err(e) = process.close().await {
                    warn!("Failed to stop capture process: {e}");
                }
            }
        })
    }
}

/// Starts an [`HcidumpCapture`] on one device.
pub struct HcidumpSource {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub device: String,
    pub retry: RetryPolicy,
    pub use_sudo: bool,
}

impl HcidumpSource {
    fn spawn(&self, argv: &[String], capture_stdout: bool) -> Result<Box<dyn CaptureProcess>, ScanError> {
        info!("FYI: Spawning process: {}", argv.join(" "));
        self.launcher
            .spawn(argv, capture_stdout)
            .map_err(|source| ScanError::Spawn {
                command: argv.join(" "),
                source,
            })
    }

    async fn start(self) -> Result<HcidumpCapture, ScanError> {
        info!("Start receiving broadcasts (device {})", self.device);

        let reset = reset_command(&self.device, self.use_sudo);
        reset_adapter(self.launcher.as_ref(), &reset, &self.device, self.retry).await?;

        let mut scanner = self.spawn(&scan_command(&self.device, self.use_sudo), false)?;

        let dump_argv = dump_command(&self.device, self.use_sudo);
        let mut dump = match self.spawn(&dump_argv, true) {
            Ok(dump) => dump,
            Err(e) => {
                close_quietly(scanner.as_mut()).await;
                return Err(e);
            }
        };

        let Some(stdout) = dump.take_stdout() else {
            close_quietly(scanner.as_mut()).await;
            close_quietly(dump.as_mut()).await;
            return Err(ScanError::Spawn {
                command: dump_argv.join(" "),
                source: io::Error::other("stdout was not captured"),
            });
        };

        Ok(HcidumpCapture {
            scanner,
            dump,
            frames: FrameReader::new(BufReader::new(stdout)),
            closed: false,
        })
    }
}

async fn close_quietly(process: &mut dyn CaptureProcess) {
    if let Err(e) = process.close().await {
        warn!("Failed to stop capture process: {e}");
    }
}

impl CaptureSource for HcidumpSource {
    fn open(self) -> BoxFuture<'static, Result<Box<dyn Capture>, ScanError>> {
        Box::pin(async move {
            let capture = self.start().await?;
            Ok(Box::new(capture) as Box<dyn Capture>)
        })
    }
}

/// [`Communication`] over hcitool and hcidump.
pub struct HcidumpCommunication {
    launcher: Arc<dyn ProcessLauncher>,
    retry: RetryPolicy,
    use_sudo: bool,
    poll_interval: Duration,
}

impl HcidumpCommunication {
    pub fn new(config: &ScanConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    pub fn with_launcher(config: &ScanConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            launcher,
            retry: config.retry_policy(),
            use_sudo: config.use_sudo,
            poll_interval: config.poll_interval,
        }
    }
}

impl Communication for HcidumpCommunication {
    fn get_datas<'a>(
        &'a self,
        blacklist: Blacklist,
        device: &'a str,
    ) -> BoxFuture<'a, Result<AdvertisementStream, ScanError>> {
        let source = HcidumpSource {
            launcher: Arc::clone(&self.launcher),
            device: process_device(device),
            retry: self.retry,
            use_sudo: self.use_sudo,
        };
        Box::pin(AdvertisementStream::open(source, blacklist, self.poll_interval))
    }
}
