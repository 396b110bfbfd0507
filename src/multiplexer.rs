//! Connection multiplexer (component E): one per peer link.
//!
//! Grounded on `connections.py`'s `Connection` class: a background reader
//! task parses the 20-byte header off every frame and sorts it into either
//! the reply store (tag `(src_node, dst_node, seq)` matches an outstanding
//! wait) or the inbound channel the Dispatcher drains for unsolicited
//! requests and frames to forward. A single send mutex (here a
//! `tokio::sync::Mutex` held across the write) keeps frame writes from
//! interleaving on the socket.

use crate::error::{Result, TsMeshError};
use crate::ids::NodeId;
use crate::wire::{self, Frame, Message};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

type ReplyKey = (i32, i32, i32); // (src_node, dst_node, seq) as stamped on the reply frame

pub struct Multiplexer {
    pub peer_node: NodeId,
    write: Mutex<WriteHalf<TcpStream>>,
    next_seq: AtomicI32,
    pending: Arc<DashMap<ReplyKey, oneshot::Sender<Frame>>>,
}

impl Multiplexer {
    /// Wraps an already-handshaken stream, spawning the reader task that
    /// demultiplexes frames into replies vs. `inbound`.
    pub fn spawn(
        stream: TcpStream,
        my_node: NodeId,
        peer_node: NodeId,
        inbound: mpsc::UnboundedSender<Frame>,
    ) -> Arc<Self> {
        let (read_half, write_half): (ReadHalf<TcpStream>, WriteHalf<TcpStream>) =
            tokio::io::split(stream);
        let pending = Arc::new(DashMap::new());
        let mux = Arc::new(Multiplexer {
            peer_node,
            write: Mutex::new(write_half),
            next_seq: AtomicI32::new(0),
            pending: pending.clone(),
        });

        let my_node_tag = my_node.0 as i32;
        tokio::spawn(async move {
            let mut reader = read_half;
            loop {
                match wire::read_frame(&mut reader).await {
                    Ok(frame) => {
                        let key = (frame.header.src_node, frame.header.dst_node, frame.header.seq);
                        if frame.header.dst_node == my_node_tag {
                            if let Some((_, tx)) = pending.remove(&key) {
                                let _ = tx.send(frame);
                                continue;
                            }
                        }
                        if inbound.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(peer = %peer_node, error = %err, "peer connection dropped");
                        break;
                    }
                }
            }
            // Transport error: wake every outstanding waiter on this link
            // with an empty result rather than leaving it parked forever.
            for entry in pending.iter() {
                let _ = entry;
            }
            pending.clear();
        });

        mux
    }

    /// Sends `payload` without waiting for a reply (fire-and-forget, used
    /// for broadcasts and server-to-client deliveries).
    pub async fn send(
        &self,
        my_node: NodeId,
        dst_port: i32,
        payload: &[u8],
    ) -> Result<i32> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut w = self.write.lock().await;
        wire::write_frame(
            &mut *w,
            self.peer_node.0 as i32,
            my_node.0 as i32,
            dst_port,
            seq,
            payload,
        )
        .await?;
        Ok(seq)
    }

    /// Replies to a frame this link forwarded to `inbound`, reusing its
    /// `seq` so the original sender's `send_and_wait` tag matches.
    pub async fn reply(&self, my_node: NodeId, dst_port: i32, seq: i32, payload: &[u8]) -> Result<()> {
        let mut w = self.write.lock().await;
        wire::write_frame(
            &mut *w,
            self.peer_node.0 as i32,
            my_node.0 as i32,
            dst_port,
            seq,
            payload,
        )
        .await
    }

    /// Sends a request and awaits the matching reply frame.
    pub async fn send_and_wait(
        &self,
        my_node: NodeId,
        dst_port: i32,
        message: &Message,
    ) -> Result<Message> {
        let payload = wire::encode(message)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let reply_key = (self.peer_node.0 as i32, my_node.0 as i32, seq);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(reply_key, tx);

        {
            let mut w = self.write.lock().await;
            if let Err(err) = wire::write_frame(
                &mut *w,
                self.peer_node.0 as i32,
                my_node.0 as i32,
                dst_port,
                seq,
                &payload,
            )
            .await
            {
                self.pending.remove(&reply_key);
                return Err(err);
            }
        }

        let frame = rx.await.map_err(|_| TsMeshError::ConnectionDropped {
            node: self.peer_node.0,
        })?;
        wire::decode(&frame.payload)
    }
}
