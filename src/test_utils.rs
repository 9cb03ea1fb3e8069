use crate::advertisement::Advertisement;
use crate::mac_address::MacAddress;
use crate::scanner::ScanError;
use crate::session::{Capture, CaptureSource};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Advertising report of a RuuviTag (data format 5), from the data length
/// byte to the trailing RSSI.
pub const RUUVI_REPORT: &[u8] = &[
    0x1F, 0x02, 0x01, 0x06, 0x1B, 0xFF, 0x99, 0x04, 0x05, 0x12, 0xFC, 0x53, 0x94, 0xC3, 0x7C,
    0x00, 0x04, 0xFF, 0xFC, 0x04, 0x0C, 0xAC, 0x36, 0x42, 0x00, 0xCD, 0xCB, 0xB8, 0x33, 0x4C,
    0x88, 0x4F, 0xB6,
];

/// Hex of an LE Meta event carrying one advertising report.
///
/// `wire_mac` is in over-the-air (little-endian) order.
pub fn advertising_frame(wire_mac: [u8; 6], report: &[u8]) -> String {
    let mut bytes = vec![0x04, 0x3E, (10 + report.len()) as u8, 0x02, 0x01, 0x03, 0x01];
    bytes.extend_from_slice(&wire_mac);
    bytes.extend_from_slice(report);
    hex::encode_upper(bytes)
}

/// Print `frame` the way `hcidump --raw` does: an inbound marker, then
/// space-separated bytes wrapped at 20 per line.
#[cfg(feature = "hcidump")]
pub fn hcidump_lines(frame: &str) -> String {
    let bytes: Vec<&str> = (0..frame.len())
        .step_by(2)
        .map(|i| &frame[i..(i + 2).min(frame.len())])
        .collect();

    let mut out = String::new();
    for (i, chunk) in bytes.chunks(20).enumerate() {
        out.push_str(if i == 0 { "> " } else { "  " });
        out.push_str(&chunk.join(" "));
        out.push('\n');
    }
    if out.is_empty() {
        out.push_str("> \n");
    }
    out
}

/// A [`CaptureSource`] that replays a fixed list of advertisements.
///
/// Once the list runs out the capture either reports EOF or idles until the
/// session stops it.
pub struct ScriptedSource {
    script: VecDeque<Advertisement>,
    eof: bool,
    fail: bool,
    opened: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Advertisement>) -> Self {
        Self {
            script: script.into(),
            eof: false,
            fail: false,
            opened: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ending_with_eof(mut self) -> Self {
        self.eof = true;
        self
    }

    pub fn failing_to_open(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Number of successful opens.
    pub fn opened(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opened)
    }

    /// Number of times the capture was closed.
    pub fn closes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl CaptureSource for ScriptedSource {
    fn open(self) -> BoxFuture<'static, Result<Box<dyn Capture>, ScanError>> {
        Box::pin(async move {
            if self.fail {
                return Err(ScanError::Bluetooth("adapter not found".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedCapture {
                script: self.script,
                eof: self.eof,
                closes: self.closes,
            }) as Box<dyn Capture>)
        })
    }
}

struct ScriptedCapture {
    script: VecDeque<Advertisement>,
    eof: bool,
    closes: Arc<AtomicUsize>,
}

impl Capture for ScriptedCapture {
    fn next(&mut self, idle: Duration) -> BoxFuture<'_, Result<Option<Advertisement>, ScanError>> {
        Box::pin(async move {
            if let Some(advertisement) = self.script.pop_front() {
                return Ok(Some(advertisement));
            }
            if self.eof {
                return Err(ScanError::CaptureEof);
            }
            tokio::time::sleep(idle).await;
            Ok(None)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
        })
    }
}

#[cfg(feature = "hcidump")]
pub use fake_launcher::FakeLauncher;

#[cfg(feature = "hcidump")]
mod fake_launcher {
    use crate::scanner::process::{CaptureProcess, ProcessLauncher, ProcessOutput};
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncRead;

    /// A [`ProcessLauncher`] with scripted exit codes and canned output.
    ///
    /// `run` pops the next exit code (1 once the script is used up). The
    /// first process spawned with captured stdout gets the output set with
    /// [`FakeLauncher::set_dump_output`].
    #[derive(Default)]
    pub struct FakeLauncher {
        exit_codes: Mutex<VecDeque<i32>>,
        runs: AtomicUsize,
        spawned: Mutex<Vec<Vec<String>>>,
        spawn_attempts: AtomicUsize,
        fail_spawn_at: Option<usize>,
        output: Mutex<Option<ProcessOutput>>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        pub fn new(exit_codes: Vec<i32>) -> Self {
            Self {
                exit_codes: Mutex::new(exit_codes.into()),
                ..Self::default()
            }
        }

        /// Make the `n`th spawn (counting from 0) fail.
        pub fn failing_spawn_at(mut self, n: usize) -> Self {
            self.fail_spawn_at = Some(n);
            self
        }

        pub fn set_dump_output(&self, output: impl AsyncRead + Send + Unpin + 'static) {
            *self.output.lock().unwrap() = Some(Box::new(output));
        }

        pub fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        /// Command lines of the processes spawned successfully.
        pub fn spawned(&self) -> Vec<Vec<String>> {
            self.spawned.lock().unwrap().clone()
        }

        /// Number of process closes across all spawned processes.
        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn run<'a>(&'a self, _argv: &'a [String]) -> BoxFuture<'a, io::Result<i32>> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                Ok(self.exit_codes.lock().unwrap().pop_front().unwrap_or(1))
            })
        }

        fn spawn(&self, argv: &[String], capture_stdout: bool) -> io::Result<Box<dyn CaptureProcess>> {
            let attempt = self.spawn_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_spawn_at == Some(attempt) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
            }

            self.spawned.lock().unwrap().push(argv.to_vec());
            let stdout = if capture_stdout {
                self.output.lock().unwrap().take()
            } else {
                None
            };
            Ok(Box::new(FakeProcess {
                stdout,
                closed: false,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    struct FakeProcess {
        stdout: Option<ProcessOutput>,
        closed: bool,
        closes: Arc<AtomicUsize>,
    }

    impl CaptureProcess for FakeProcess {
        fn take_stdout(&mut self) -> Option<ProcessOutput> {
            self.stdout.take()
        }

        fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
            Box::pin(async move {
                if !self.closed {
                    self.closed = true;
                    self.closes.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
        }
    }
}
