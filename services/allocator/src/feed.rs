//! Event feed sources.
//!
//! A feed hands the reconciliation listener a stream of decoded events per
//! connection. When the stream ends or fails the listener reconnects.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use crpark_events::{EventError, FeedEvent, LineDecoder};
use futures_core::Stream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Feed failures.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to connect to event feed: {0}")]
    Connect(String),

    #[error("event feed returned status {0}")]
    Status(u16),

    #[error("event feed transport error: {0}")]
    Transport(String),

    /// One message could not be decoded; the connection is still usable.
    #[error("undecodable feed message: {0}")]
    Decode(#[from] EventError),
}

impl FeedError {
    /// Whether the connection must be dropped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

/// Events from one feed connection.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<FeedEvent, FeedError>> + Send>>;

/// A source of feed connections.
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<EventStream, FeedError>;
}

// =============================================================================
// HTTP
// =============================================================================

/// Newline-delimited JSON over a long-lived HTTP GET.
pub struct HttpEventFeed {
    client: reqwest::Client,
    url: String,
}

impl HttpEventFeed {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| FeedError::Connect(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct HttpStreamState {
    body: ByteStream,
    decoder: LineDecoder,
    pending: VecDeque<Result<FeedEvent, FeedError>>,
    done: bool,
}

#[async_trait]
impl EventFeed for HttpEventFeed {
    async fn connect(&self) -> Result<EventStream, FeedError> {
        debug!(url = %self.url, "Connecting to event feed");
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .send()
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FeedError::Status(response.status().as_u16()));
        }

        let state = HttpStreamState {
            body: Box::pin(response.bytes_stream()),
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let stream = futures_util::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(item) = st.pending.pop_front() {
                    return Some((item, st));
                }
                if st.done {
                    return None;
                }
                match st.body.next().await {
                    Some(Ok(chunk)) => {
                        let decoded = st.decoder.push(&chunk);
                        st.pending
                            .extend(decoded.into_iter().map(|r| r.map_err(FeedError::from)));
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(FeedError::Transport(e.to_string())), st));
                    }
                    None => {
                        st.done = true;
                        if let Some(last) = st.decoder.finish() {
                            st.pending.push_back(last.map_err(FeedError::from));
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

// =============================================================================
// In-process
// =============================================================================

#[derive(Default)]
struct ChannelShared {
    current: Mutex<Option<mpsc::UnboundedSender<FeedEvent>>>,
    connects: AtomicU32,
    refuse: AtomicBool,
}

/// In-process feed for tests and embedding.
///
/// Each `connect` opens a fresh channel; [`ChannelFeed::disconnect`] ends
/// the current connection as if the network dropped.
#[derive(Clone, Default)]
pub struct ChannelFeed {
    shared: Arc<ChannelShared>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event on the live connection. Returns false if none.
    pub fn send(&self, event: FeedEvent) -> bool {
        let Ok(current) = self.shared.current.lock() else {
            return false;
        };
        current
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Drop the live connection.
    pub fn disconnect(&self) {
        if let Ok(mut current) = self.shared.current.lock() {
            current.take();
        }
    }

    /// Make subsequent connects fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` connections have been opened.
    pub async fn wait_for_connections(&self, n: u32) {
        while self.connect_count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EventFeed for ChannelFeed {
    async fn connect(&self) -> Result<EventStream, FeedError> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(FeedError::Connect("channel feed refusing connections".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut current) = self.shared.current.lock() {
            *current = Some(tx);
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crpark_events::OptimizationComplete;

    fn done(ts: i64) -> FeedEvent {
        FeedEvent::OptimizationComplete(OptimizationComplete {
            ts,
            parameters: Default::default(),
        })
    }

    #[tokio::test]
    async fn test_channel_feed_delivers_until_disconnect() {
        let feed = ChannelFeed::new();
        assert!(!feed.send(done(1)));

        let mut stream = feed.connect().await.unwrap();
        assert_eq!(feed.connect_count(), 1);
        assert!(feed.send(done(2)));
        assert_eq!(stream.next().await.unwrap().unwrap().ts(), 2);

        feed.disconnect();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_feed_refuses() {
        let feed = ChannelFeed::new();
        feed.set_refuse(true);
        assert!(matches!(feed.connect().await, Err(FeedError::Connect(_))));
        assert_eq!(feed.connect_count(), 0);
    }

    #[test]
    fn test_decode_errors_are_not_fatal() {
        assert!(!FeedError::Decode(EventError::InvalidUtf8).is_fatal());
        assert!(FeedError::Transport("reset".to_string()).is_fatal());
    }
}
