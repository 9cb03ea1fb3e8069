//! Consumer side of a capture session.

use crate::advertisement::{Advertisement, HexString};
use crate::mac_address::MacAddress;
use crate::scanner::ScanError;
use crate::session::{Blacklist, CaptureSource, Session};
use futures::Stream;
use futures::future::BoxFuture;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Advertisements from one capture session, in arrival order.
///
/// The stream ends when the producer stops on its own (for example because
/// hcidump exited). Closing or dropping the stream stops the producer.
#[derive(Debug)]
pub struct AdvertisementStream {
    session: Session,
    rx: mpsc::UnboundedReceiver<Advertisement>,
}

impl AdvertisementStream {
    /// Start `source` in a new session and stream what it captures.
    pub async fn open<S: CaptureSource>(
        source: S,
        blacklist: Blacklist,
        poll_interval: Duration,
    ) -> Result<Self, ScanError> {
        let mut session = Session::new(blacklist, poll_interval);
        let rx = session.start(source).await?;
        Ok(Self { session, rx })
    }

    /// Wait for the next advertisement. `None` once the producer has stopped.
    pub async fn next(&mut self) -> Option<Advertisement> {
        self.rx.recv().await
    }

    /// Stop the producer and wait until its resources are released.
    pub async fn close(mut self) {
        self.rx.close();
        self.session.stop().await;
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Stream for AdvertisementStream {
    type Item = Advertisement;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Read `stream` until an advertisement from `mac` arrives, then close it.
///
/// Returns `None` if the producer stopped first.
pub async fn find_one(mut stream: AdvertisementStream, mac: MacAddress) -> Option<HexString> {
    let mut found = None;
    while let Some(advertisement) = stream.next().await {
        if advertisement.mac == Some(mac) {
            info!("Data found");
            found = Some(advertisement.payload);
            break;
        }
    }
    stream.close().await;
    found
}

/// Operations shared by both capture backends.
pub trait Communication: Send + Sync {
    /// Start capturing on `device` and stream every advertisement whose MAC
    /// is not in `blacklist`.
    ///
    /// Fails when the capture cannot be started. An empty `device` selects
    /// the backend's default.
    fn get_datas<'a>(
        &'a self,
        blacklist: Blacklist,
        device: &'a str,
    ) -> BoxFuture<'a, Result<AdvertisementStream, ScanError>>;

    /// Capture until `mac` is seen and return its payload.
    ///
    /// Returns `Ok(None)` if the capture ended before `mac` showed up. There
    /// is no timeout; wrap the call in one if needed.
    fn get_data<'a>(
        &'a self,
        mac: MacAddress,
        device: &'a str,
    ) -> BoxFuture<'a, Result<Option<HexString>, ScanError>> {
        Box::pin(async move {
            let stream = self.get_datas(Blacklist::default(), device).await?;
            Ok(find_one(stream, mac).await)
        })
    }
}
