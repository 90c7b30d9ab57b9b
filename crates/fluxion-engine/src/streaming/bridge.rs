//! Backpressure bridge between pipeline tasks.
//!
//! `Buffered(n)` is a bounded channel: a full bridge blocks the sender.
//! `Handoff` is a rendezvous: the sender resumes only once a receiver has
//! taken the item. Every send and receive races the run's cancellation token.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    Handoff,
    Buffered(usize),
}

/// The other side is gone or the run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bridge closed")]
pub struct BridgeClosed;

struct Envelope<T> {
    item: T,
    ack: Option<oneshot::Sender<()>>,
}

pub struct BridgeSender<T> {
    tx: mpsc::Sender<Envelope<T>>,
    handoff: bool,
}

impl<T> Clone for BridgeSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            handoff: self.handoff,
        }
    }
}

/// Shared by every consumer; each item goes to exactly one of them.
pub struct BridgeReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<Envelope<T>>>>,
}

impl<T> Clone for BridgeReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

/// Create a bridge. `Buffered(0)` behaves like `Handoff`.
#[must_use]
pub fn bridge<T>(mode: BridgeMode) -> (BridgeSender<T>, BridgeReceiver<T>) {
    let (capacity, handoff) = match mode {
        BridgeMode::Handoff | BridgeMode::Buffered(0) => (1, true),
        BridgeMode::Buffered(capacity) => (capacity, false),
    };
    let (tx, rx) = mpsc::channel(capacity);
    (
        BridgeSender { tx, handoff },
        BridgeReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl<T> BridgeSender<T> {
    /// Send `item`, waiting for room (buffered) or for a taker (handoff).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeClosed`] if every receiver is gone or `cancel` fires
    /// first; the item is dropped.
    pub async fn send(&self, item: T, cancel: &CancellationToken) -> Result<(), BridgeClosed> {
        let (ack, taken) = if self.handoff {
            let (ack, taken) = oneshot::channel();
            (Some(ack), Some(taken))
        } else {
            (None, None)
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BridgeClosed),
            sent = self.tx.send(Envelope { item, ack }) => sent.map_err(|_| BridgeClosed)?,
        }
        if let Some(taken) = taken {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(BridgeClosed),
                acked = taken => acked.map_err(|_| BridgeClosed)?,
            }
        }
        Ok(())
    }
}

impl<T> BridgeReceiver<T> {
    /// Next item, or `None` once all senders are dropped and the bridge is
    /// empty, or `cancel` fires.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<T> {
        let mut rx = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        let envelope = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            envelope = rx.recv() => envelope?,
        };
        if let Some(ack) = envelope.ack {
            let _ = ack.send(());
        }
        Some(envelope.item)
    }

    /// Close the bridge and hand every queued item to `discard`.
    /// Returns how many items were discarded.
    pub async fn drain(&self, mut discard: impl FnMut(T)) -> usize {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut drained = 0;
        while let Ok(envelope) = rx.try_recv() {
            discard(envelope.item);
            drained += 1;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn buffered_blocks_when_full() {
        let (tx, rx) = bridge::<u32>(BridgeMode::Buffered(2));
        let cancel = CancellationToken::new();
        tx.send(1, &cancel).await.unwrap();
        tx.send(2, &cancel).await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(50), tx.send(3, &cancel)).await;
        assert!(third.is_err(), "third send should block on a full bridge");
        assert_eq!(rx.recv(&cancel).await, Some(1));
        assert_eq!(rx.recv(&cancel).await, Some(2));
    }

    #[tokio::test]
    async fn handoff_waits_for_a_taker() {
        let (tx, rx) = bridge::<u32>(BridgeMode::Handoff);
        let cancel = CancellationToken::new();
        let delivered = Arc::new(AtomicBool::new(false));
        let sender = {
            let delivered = Arc::clone(&delivered);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tx.send(7, &cancel).await.unwrap();
                delivered.store(true, Ordering::SeqCst);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!delivered.load(Ordering::SeqCst));
        assert_eq!(rx.recv(&cancel).await, Some(7));
        sender.await.unwrap();
        assert!(delivered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellation_unblocks_both_sides() {
        let (tx, rx) = bridge::<u32>(BridgeMode::Handoff);
        let cancel = CancellationToken::new();
        let waiting_recv = {
            let rx = rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { rx.recv(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(waiting_recv.await.unwrap(), None);
        assert_eq!(tx.send(1, &cancel).await, Err(BridgeClosed));
    }

    #[tokio::test]
    async fn recv_ends_when_senders_drop_and_drain_counts() {
        let (tx, rx) = bridge::<u32>(BridgeMode::Buffered(4));
        let cancel = CancellationToken::new();
        tx.send(1, &cancel).await.unwrap();
        tx.send(2, &cancel).await.unwrap();
        drop(tx);
        let mut seen = Vec::new();
        assert_eq!(rx.drain(|item| seen.push(item)).await, 2);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(rx.recv(&cancel).await, None);
    }
}
