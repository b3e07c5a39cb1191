use crate::metrics::METRICS;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::SinkExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace};

use tb_types::wire::MAX_FRAME_BYTES;

/// Length-delimited codec shared by every channel.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// One push-only fanout channel (Result, Live or Event). Each attached
/// connection gets a bounded queue and its own writer task; a full queue
/// drops the frame for that connection rather than stalling the publisher.
#[derive(Clone)]
pub struct PushChannel {
    name: &'static str,
    capacity: usize,
    conns: Arc<DashMap<u64, mpsc::Sender<Bytes>>>,
    next_id: Arc<AtomicU64>,
}

impl PushChannel {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            conns: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach a TCP connection. The writer task drains the queue until the
    /// peer goes away, then detaches itself.
    pub fn attach(&self, stream: TcpStream) -> u64 {
        let (tx, mut rx) = mpsc::channel::<Bytes>(self.capacity);
        let id = self.register(tx);
        let name = self.name;
        let conns = Arc::clone(&self.conns);
        let mut framed = FramedWrite::new(stream, frame_codec());
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = framed.send(frame).await {
                    debug!(channel = name, conn = id, error = %e, "push write failed");
                    break;
                }
            }
            conns.remove(&id);
            debug!(channel = name, conn = id, "push connection detached");
        });
        id
    }

    /// Attach a raw queue instead of a socket. In-process consumers and
    /// tests read pushed frames straight from the receiver.
    pub fn attach_sender(&self, tx: mpsc::Sender<Bytes>) -> u64 {
        self.register(tx)
    }

    fn register(&self, tx: mpsc::Sender<Bytes>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(id, tx);
        id
    }

    pub fn detach(&self, id: u64) {
        self.conns.remove(&id);
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Serialize once, fan out to every connection. Returns how many
    /// queues accepted the frame.
    pub fn publish<T: Serialize>(&self, payload: &T) -> usize {
        match serde_json::to_vec(payload) {
            Ok(raw) => self.publish_raw(Bytes::from(raw)),
            Err(e) => {
                debug!(channel = self.name, error = %e, "push serialize failed");
                0
            }
        }
    }

    pub fn publish_raw(&self, frame: Bytes) -> usize {
        let mut sent = 0u64;
        let mut dropped = 0u64;
        let mut dead = Vec::new();
        for entry in self.conns.iter() {
            match entry.value().try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    trace!(channel = self.name, conn = entry.key(), "queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }
        for id in dead {
            self.conns.remove(&id);
        }
        METRICS.inc_pushes_sent(sent);
        METRICS.inc_pushes_dropped(dropped);
        sent as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_attached_sender() {
        let chan = PushChannel::new("test", 8);
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        chan.attach_sender(tx1);
        chan.attach_sender(tx2);

        let delivered = chan.publish(&serde_json::json!({"error": false}));
        assert_eq!(delivered, 2);
        assert_eq!(rx1.recv().await.unwrap(), rx2.recv().await.unwrap());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let chan = PushChannel::new("test", 1);
        let (tx, mut rx) = mpsc::channel(1);
        chan.attach_sender(tx);

        assert_eq!(chan.publish(&1u32), 1);
        assert_eq!(chan.publish(&2u32), 0); // queue full, dropped
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned() {
        let chan = PushChannel::new("test", 4);
        let (tx, rx) = mpsc::channel(4);
        chan.attach_sender(tx);
        drop(rx);
        chan.publish(&0u32);
        assert_eq!(chan.conn_count(), 0);
    }
}
