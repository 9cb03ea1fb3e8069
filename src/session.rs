//! Lifecycle of a background capture producer.
//!
//! A [`Session`] moves through `Idle → Starting → Running → Stopping →
//! Stopped`, or `Starting → Failed` when the capture source cannot be brought
//! up. While running, a worker task pulls advertisements from a [`Capture`],
//! drops blacklisted ones and pushes the rest into an unbounded queue.
//!
//! The only state shared with the worker is [`SessionState`]: a one-way
//! `running` flag and a blacklist that is fixed before the worker starts.

use crate::advertisement::Advertisement;
use crate::mac_address::MacAddress;
use crate::scanner::ScanError;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// MAC addresses whose advertisements are never delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist(HashSet<MacAddress>);

impl Blacklist {
    /// An advertisement without an address is never blacklisted.
    pub fn contains(&self, mac: Option<&MacAddress>) -> bool {
        mac.is_some_and(|mac| self.0.contains(mac))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<MacAddress> for Blacklist {
    fn from_iter<I: IntoIterator<Item = MacAddress>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// State shared between a session and its worker.
#[derive(Debug)]
pub struct SessionState {
    running: AtomicBool,
    blacklist: Blacklist,
}

impl SessionState {
    pub fn new(blacklist: Blacklist) -> Self {
        Self {
            running: AtomicBool::new(true),
            blacklist,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the running flag. Returns `true` for the call that cleared it.
    pub fn request_stop(&self) -> bool {
        self.running.swap(false, Ordering::AcqRel)
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Whether `advertisement` may be handed to the consumer.
    pub fn admits(&self, advertisement: &Advertisement) -> bool {
        !self.blacklist.contains(advertisement.mac.as_ref())
    }
}

/// Lifecycle phase of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// A running capture: an hcidump process pair or an observer registration.
pub trait Capture: Send {
    /// Wait for the next advertisement.
    ///
    /// Resolves with `Ok(None)` when nothing arrived within `idle`, so the
    /// caller can check for shutdown. An error ends the session.
    fn next(&mut self, idle: Duration) -> BoxFuture<'_, Result<Option<Advertisement>, ScanError>>;

    /// Release the underlying OS resources.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Something that can bring a [`Capture`] up.
pub trait CaptureSource: Send {
    fn open(self) -> BoxFuture<'static, Result<Box<dyn Capture>, ScanError>>;
}

/// Owner of one background producer.
///
/// Dropping a running session clears the running flag; the worker then
/// releases its resources on its own within one poll interval. Use
/// [`Session::stop`] to also wait for that to happen.
#[derive(Debug)]
pub struct Session {
    state: Arc<SessionState>,
    phase: Arc<watch::Sender<Phase>>,
    poll_interval: Duration,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(blacklist: Blacklist, poll_interval: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            state: Arc::new(SessionState::new(blacklist)),
            phase: Arc::new(phase),
            poll_interval,
            worker: None,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch phase changes, including those made by the worker.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Open `source` and start the worker.
    ///
    /// On failure the session ends up [`Phase::Failed`] and nothing is
    /// spawned.
    pub async fn start<S: CaptureSource>(
        &mut self,
        source: S,
    ) -> Result<mpsc::UnboundedReceiver<Advertisement>, ScanError> {
        if self.phase() != Phase::Idle {
            return Err(ScanError::AlreadyStarted);
        }
        self.phase.send_replace(Phase::Starting);

        let capture = match source.open().await {
            Ok(capture) => capture,
            Err(e) => {
                warn!("Capture failed to start: {e}");
                self.state.request_stop();
                self.phase.send_replace(Phase::Failed);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.phase.send_replace(Phase::Running);
        self.worker = Some(tokio::spawn(run_worker(
            capture,
            Arc::clone(&self.state),
            tx,
            Arc::clone(&self.phase),
            self.poll_interval,
        )));

        Ok(rx)
    }

    /// Stop the worker and wait until it has released its resources.
    ///
    /// Calling this again, or on a session that never started, does nothing.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.state.request_stop();
        self.phase.send_if_modified(|phase| {
            let running = *phase == Phase::Running;
            if running {
                *phase = Phase::Stopping;
            }
            running
        });

        if let Err(e) = worker.await {
            warn!("Capture worker failed: {e}");
            self.phase.send_replace(Phase::Stopped);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.state.request_stop();
    }
}

async fn run_worker(
    mut capture: Box<dyn Capture>,
    state: Arc<SessionState>,
    tx: mpsc::UnboundedSender<Advertisement>,
    phase: Arc<watch::Sender<Phase>>,
    poll_interval: Duration,
) {
    while state.is_running() && !tx.is_closed() {
        match capture.next(poll_interval).await {
            Ok(Some(advertisement)) => {
                if !state.admits(&advertisement) {
                    debug!("MAC blacklisted: {:?}", advertisement.mac);
                    continue;
                }
                if tx.send(advertisement).is_err() {
                    debug!("Consumer went away");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Capture ended: {e}");
                break;
            }
        }
    }

    if state.request_stop() {
        info!("Capture finished, stopping session");
    }
    phase.send_replace(Phase::Stopping);
    capture.close().await;
    phase.send_replace(Phase::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::HexString;
    use crate::test_utils::{ScriptedSource, TEST_MAC};
    use std::sync::atomic::AtomicUsize;

    const POLL: Duration = Duration::from_millis(10);

    fn advertisement(mac: Option<MacAddress>, payload: &[u8]) -> Advertisement {
        Advertisement::new(mac, HexString::from_bytes(payload))
    }

    async fn wait_for_phase(rx: &mut watch::Receiver<Phase>, expected: Phase) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| *p == expected))
            .await
            .expect("timed out waiting for phase")
            .expect("phase channel closed");
    }

    #[test]
    fn test_blacklist_ignores_missing_mac() {
        let blacklist: Blacklist = [TEST_MAC].into_iter().collect();
        assert!(blacklist.contains(Some(&TEST_MAC)));
        assert!(!blacklist.contains(Some(&MacAddress([0; 6]))));
        assert!(!blacklist.contains(None));
    }

    #[test]
    fn test_request_stop_flips_once() {
        let state = SessionState::new(Blacklist::default());
        assert!(state.is_running());
        assert!(state.request_stop());
        assert!(!state.request_stop());
        assert!(!state.is_running());
    }

    #[tokio::test]
    async fn test_session_delivers_and_filters() {
        let other = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let source = ScriptedSource::new(vec![
            advertisement(Some(TEST_MAC), &[0x01]),
            advertisement(Some(other), &[0x02]),
            advertisement(None, &[0x03]),
            advertisement(Some(TEST_MAC), &[0x04]),
        ])
        .ending_with_eof();
        let closes = source.closes();

        let mut session = Session::new([TEST_MAC].into_iter().collect(), POLL);
        assert_eq!(session.phase(), Phase::Idle);
        let mut rx = session.start(source).await.unwrap();

        let mut received = Vec::new();
        while let Some(adv) = rx.recv().await {
            received.push(adv);
        }
        assert_eq!(
            received,
            vec![advertisement(Some(other), &[0x02]), advertisement(None, &[0x03])]
        );

        // The capture hit EOF, so the worker has shut down by itself.
        wait_for_phase(&mut session.subscribe(), Phase::Stopped).await;
        assert!(!session.state().is_running());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        session.stop().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let source = ScriptedSource::new(vec![]);
        let closes = source.closes();

        let mut session = Session::new(Blacklist::default(), POLL);
        let _rx = session.start(source).await.unwrap();
        assert_eq!(session.phase(), Phase::Running);

        session.stop().await;
        assert_eq!(session.phase(), Phase::Stopped);
        session.stop().await;
        assert_eq!(session.phase(), Phase::Stopped);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_start_spawns_nothing() {
        let source = ScriptedSource::new(vec![]).failing_to_open();
        let opened = source.opened();

        let mut session = Session::new(Blacklist::default(), POLL);
        let result = session.start(source).await;

        assert!(matches!(result, Err(ScanError::Bluetooth(_))));
        assert_eq!(session.phase(), Phase::Failed);
        assert_eq!(opened.load(Ordering::SeqCst), 0);

        // Nothing to stop.
        session.stop().await;
        assert_eq!(session.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut session = Session::new(Blacklist::default(), POLL);
        let _rx = session.start(ScriptedSource::new(vec![])).await.unwrap();
        assert!(matches!(
            session.start(ScriptedSource::new(vec![])).await,
            Err(ScanError::AlreadyStarted)
        ));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_dropping_session_stops_worker() {
        let source = ScriptedSource::new(vec![]);
        let closes = source.closes();

        let mut session = Session::new(Blacklist::default(), POLL);
        let _rx = session.start(source).await.unwrap();
        let mut phase = session.subscribe();
        drop(session);

        wait_for_phase(&mut phase, Phase::Stopped).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_receiver_stops_worker() {
        let source = ScriptedSource::new(vec![advertisement(Some(TEST_MAC), &[0x01])]);
        let closes: Arc<AtomicUsize> = source.closes();

        let mut session = Session::new(Blacklist::default(), POLL);
        let rx = session.start(source).await.unwrap();
        let mut phase = session.subscribe();
        drop(rx);

        wait_for_phase(&mut phase, Phase::Stopped).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        session.stop().await;
    }
}
