//! In-process pair transport for router tests
//!
//! [`pair`] returns two connected ends: whatever one end sends, the other
//! receives. The router is handed one end while the test drives the
//! other, standing in for the stdio client or the remote server.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{McpRemoteError, Result};
use crate::transport::{channel_stream, Transport};

/// One end of an in-process transport pair.
#[derive(Debug)]
pub struct FakeTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
}

/// Creates a connected transport pair.
pub fn pair() -> (FakeTransport, FakeTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        FakeTransport {
            tx: Mutex::new(Some(a_tx)),
            rx: Arc::new(tokio::sync::Mutex::new(b_rx)),
        },
        FakeTransport {
            tx: Mutex::new(Some(b_tx)),
            rx: Arc::new(tokio::sync::Mutex::new(a_rx)),
        },
    )
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send(&self, message: String) -> Result<()> {
        let guard = self.tx.lock().expect("tx mutex");
        match guard.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| McpRemoteError::Transport("peer closed".into()).into()),
            None => Err(McpRemoteError::Transport("fake transport closed".into()).into()),
        }
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        channel_stream(Arc::clone(&self.rx))
    }

    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        Box::pin(futures::stream::pending())
    }

    async fn close(&self) {
        self.tx.lock().expect("tx mutex").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    #[tokio::test]
    async fn test_pair_is_cross_connected() {
        let (a, b) = pair();
        a.send("from-a".to_string()).await.expect("send");
        b.send("from-b".to_string()).await.expect("send");

        let mut a_rx = a.receive();
        let mut b_rx = b.receive();
        assert_eq!(b_rx.next().await.as_deref(), Some("from-a"));
        assert_eq!(a_rx.next().await.as_deref(), Some("from-b"));
    }

    #[tokio::test]
    async fn test_close_ends_the_peer_stream() {
        let (a, b) = pair();
        a.close().await;
        let mut b_rx = b.receive();
        assert!(b_rx.next().await.is_none(), "stream must end after close");
    }
}
