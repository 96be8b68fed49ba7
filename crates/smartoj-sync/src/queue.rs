//! Bounded handoff between the reader thread and the scheduler.
//!
//! The reader thread calls [`BatchSender::send_blocking`], which parks the
//! OS thread while the queue is full; the dispatcher awaits
//! [`BatchReceiver::recv`]. Order is strictly FIFO and nothing is dropped.

use crate::error::{Result, SyncError};
use crate::event::Batch;
use tokio::sync::mpsc;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// Create a handoff queue holding at most `capacity` batches.
pub fn handoff(capacity: usize) -> (BatchSender, BatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BatchSender { tx }, BatchReceiver { rx })
}

/// Producer half, used from the reader's OS thread.
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Batch>,
}

impl BatchSender {
    /// Enqueue a batch, blocking the calling thread while the queue is full.
    ///
    /// Must not be called from inside the async runtime. Fails only when the
    /// receiving side is gone.
    pub fn send_blocking(&self, batch: Batch) -> Result<()> {
        self.tx
            .blocking_send(batch)
            .map_err(|_| SyncError::ConnectionClosed)
    }

    /// Async variant for producers living on the runtime (tests, replays).
    pub async fn send(&self, batch: Batch) -> Result<()> {
        self.tx
            .send(batch)
            .await
            .map_err(|_| SyncError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the dispatcher.
pub struct BatchReceiver {
    rx: mpsc::Receiver<Batch>,
}

impl BatchReceiver {
    /// Next batch in FIFO order; `None` once every sender is dropped and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Batch> {
        self.rx.recv().await
    }

    /// Batches currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Refuse further sends; buffered batches can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BinlogPosition;

    fn batch(offset: u64) -> Batch {
        Batch::new(Vec::new(), BinlogPosition::new("binlog.000001", offset))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = handoff(4);
        for offset in [10, 20, 30] {
            tx.send(batch(offset)).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(b) = rx.recv().await {
            seen.push(b.position.offset);
        }
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_blocking_send_from_thread() {
        let (tx, mut rx) = handoff(1);
        let producer = std::thread::spawn(move || {
            for offset in 1..=5 {
                tx.send_blocking(batch(offset)).unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(b) = rx.recv().await {
            seen.push(b.position.offset);
        }
        producer.join().unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_fails() {
        let (tx, rx) = handoff(1);
        drop(rx);
        assert!(tx.is_closed());
        let result = std::thread::spawn(move || tx.send_blocking(batch(1)))
            .join()
            .unwrap();
        assert!(matches!(result, Err(SyncError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_keeps_buffered() {
        let (tx, mut rx) = handoff(2);
        tx.send(batch(1)).await.unwrap();
        rx.close();
        assert!(tx.send(batch(2)).await.is_err());
        assert_eq!(rx.recv().await.map(|b| b.position.offset), Some(1));
        assert!(rx.recv().await.is_none());
    }
}
