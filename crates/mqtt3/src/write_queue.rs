//! Ordered write pipeline. Callers enqueue finalized packets freely; the
//! drain writes them strictly in enqueue order with at most one write in
//! flight, so packet B's bytes never reach the wire before the whole of
//! packet A.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::error::Result;
use crate::transport::Transport;

/// Invoked once the packet's bytes are fully on the wire, or with the
/// error that kept them off it.
pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send>;

struct QueuedPacket {
    bytes: Bytes,
    completion: Option<WriteCallback>,
    /// Packet id to announce through `pub_res_sent` after the write.
    res_sent: Option<u16>,
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    queue: VecDeque<QueuedPacket>,
}

impl WriteQueue {
    pub fn push(&mut self, bytes: Bytes, completion: Option<WriteCallback>) {
        self.queue.push_back(QueuedPacket {
            bytes,
            completion,
            res_sent: None,
        });
    }

    pub fn push_response(
        &mut self,
        bytes: Bytes,
        completion: Option<WriteCallback>,
        packet_id: u16,
    ) {
        self.queue.push_back(QueuedPacket {
            bytes,
            completion,
            res_sent: Some(packet_id),
        });
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Writes queued packets in FIFO order. Completions run after their
    /// packet is fully written; ids due a `pub_res_sent` notification are
    /// appended to `res_sent`. A failed write hands the error to that
    /// packet's completion and clears the rest of the queue.
    pub async fn drain<T: Transport>(
        &mut self,
        conn: &mut T,
        res_sent: &mut Vec<u16>,
    ) -> Result<()> {
        while let Some(packet) = self.queue.pop_front() {
            trace!(len = packet.bytes.len(), "writing queued packet");
            match conn.write_all(&packet.bytes).await {
                Ok(()) => {
                    if let Some(done) = packet.completion {
                        done(Ok(()));
                    }
                    if let Some(packet_id) = packet.res_sent {
                        res_sent.push(packet_id);
                    }
                }
                Err(err) => {
                    if let Some(done) = packet.completion {
                        done(Err(err.clone()));
                    }
                    self.queue.clear();
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let (mut conn, mut far) = tokio::io::duplex(1024);
        let mut queue = WriteQueue::default();
        queue.push(Bytes::from_static(&[0x01, 0x02]), None);
        queue.push(Bytes::from_static(&[0x03]), None);
        queue.push(Bytes::from_static(&[0x04, 0x05, 0x06]), None);

        let mut res_sent = Vec::new();
        queue.drain(&mut conn, &mut res_sent).await.unwrap();
        assert!(queue.is_empty());
        assert!(res_sent.is_empty());

        let mut out = [0u8; 6];
        AsyncReadExt::read_exact(&mut far, &mut out).await.unwrap();
        assert_eq!(out, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[tokio::test]
    async fn test_completions_and_res_sent() {
        let (mut conn, mut far) = tokio::io::duplex(1024);
        let mut queue = WriteQueue::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        queue.push(
            Bytes::from_static(&[0xAA]),
            Some(Box::new(move |result| {
                assert!(result.is_ok());
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        queue.push_response(Bytes::from_static(&[0x40, 0x02, 0x00, 0x09]), None, 9);

        let mut res_sent = Vec::new();
        queue.drain(&mut conn, &mut res_sent).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(res_sent, vec![9]);

        let mut out = [0u8; 5];
        AsyncReadExt::read_exact(&mut far, &mut out).await.unwrap();
        assert_eq!(out, [0xAA, 0x40, 0x02, 0x00, 0x09]);
    }

    #[tokio::test]
    async fn test_write_error_clears_queue() {
        let (mut conn, far) = tokio::io::duplex(64);
        drop(far);

        let mut queue = WriteQueue::default();
        let failed = Arc::new(AtomicUsize::new(0));
        let failed_clone = Arc::clone(&failed);
        queue.push(
            Bytes::from_static(&[0x01]),
            Some(Box::new(move |result| {
                assert!(result.is_err());
                failed_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        queue.push(Bytes::from_static(&[0x02]), None);

        let mut res_sent = Vec::new();
        let err = queue.drain(&mut conn, &mut res_sent).await.unwrap_err();
        assert!(err.is_clean_close());
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }
}
