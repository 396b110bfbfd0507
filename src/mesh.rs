//! Node mesh (component F): neighbours table, join protocol, broadcast.
//!
//! Grounded on `connections.py` (`neighbours`, `connectTo`,
//! `broadcast_message`, `getNeighbourDetails`) and `server.py`
//! (`get_new_node_id`, `my_name_is`, `get_connect_details`).

use crate::error::{Result, TsMeshError};
use crate::ids::NodeId;
use crate::multiplexer::Multiplexer;
use crate::wire::{self, Frame, Message, Route};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::info;

/// A direct connection or the next-hop node id through which an indirect
/// neighbour is reached.
pub struct Mesh {
    my_node: NodeId,
    my_addr: OnceLock<String>,
    neighbours: DashMap<NodeId, Route>,
    links: DashMap<NodeId, Arc<Multiplexer>>,
}

impl Mesh {
    pub fn new(my_node: NodeId) -> Self {
        Mesh {
            my_node,
            my_addr: OnceLock::new(),
            neighbours: DashMap::new(),
            links: DashMap::new(),
        }
    }

    pub fn my_node(&self) -> NodeId {
        self.my_node
    }

    /// Records the `host:port` this node itself listens on, once the
    /// listener is bound. `get_connect_details` answers requests about our
    /// own id with it; unset until the entrypoint calls this.
    pub fn set_my_addr(&self, addr: String) {
        let _ = self.my_addr.set(addr);
    }

    pub fn my_addr(&self) -> Option<&str> {
        self.my_addr.get().map(String::as_str)
    }

    pub fn route_for(&self, node: NodeId) -> Option<Route> {
        if node == self.my_node {
            return None;
        }
        self.neighbours.get(&node).map(|r| *r)
    }

    pub fn direct_neighbours(&self) -> Vec<NodeId> {
        self.links.iter().map(|e| *e.key()).collect()
    }

    /// Every node we know a route to, direct or indirect, for answering
    /// `get_neighbours` — the primitive the broadcast BFS uses to expand
    /// each hop when flooding the mesh.
    pub fn neighbour_table(&self) -> Vec<(NodeId, Route)> {
        self.neighbours.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    /// The link to use to reach `node`, resolving one hop of indirection:
    /// if `node` is itself indirect, its traffic rides the direct link to
    /// its next-hop, tagged with `node` as the real destination so that
    /// peer forwards it onward.
    pub fn link_toward(&self, node: NodeId) -> Option<Arc<Multiplexer>> {
        match self.route_for(node)? {
            Route::Direct => self.links.get(&node).map(|m| m.clone()),
            Route::Via(next_hop) => self.links.get(&next_hop).map(|m| m.clone()),
        }
    }

    pub fn record_direct(&self, node: NodeId, mux: Arc<Multiplexer>) {
        self.neighbours.insert(node, Route::Direct);
        self.links.insert(node, mux);
        info!(node = %node, "mesh: direct neighbour recorded");
    }

    /// Records a route to `node` via `next_hop` unless a route (direct or
    /// otherwise) is already known, mirroring `getNeighbourDetails`'s
    /// "only resolve once" behaviour.
    pub fn record_indirect(&self, node: NodeId, next_hop: NodeId) {
        self.neighbours.entry(node).or_insert(Route::Via(next_hop));
    }

    pub fn drop_neighbour(&self, node: NodeId) {
        self.neighbours.remove(&node);
        self.links.remove(&node);
    }

    /// Performs the client side of the join/connect handshake over a raw
    /// stream: `begin_session` -> `done`, `get_node_id` -> confirm, then
    /// `my_name_is` announcing ourselves, before handing the stream off to
    /// be wrapped in a [`Multiplexer`].
    pub async fn handshake_connect(
        stream: &mut TcpStream,
        my_node: NodeId,
        expected_peer: Option<NodeId>,
    ) -> Result<NodeId> {
        send_request(stream, my_node, &Message::BeginSession).await?;
        expect_done(stream, my_node).await?;

        let peer_node = match send_and_recv(stream, my_node, &Message::GetNodeId).await? {
            Message::NodeIdReply(n) => n,
            other => {
                return Err(TsMeshError::MalformedFrame(format!(
                    "expected node id reply, got {other:?}"
                )))
            }
        };
        if let Some(expected) = expected_peer {
            if expected != peer_node {
                return Err(TsMeshError::MalformedFrame(format!(
                    "connected to node {peer_node}, expected {expected}"
                )));
            }
        }

        send_request(
            stream,
            my_node,
            &Message::MyNameIs(my_node.to_string()),
        )
        .await?;
        expect_done(stream, my_node).await?;

        Ok(peer_node)
    }

    /// Performs the join handshake from a brand-new node's side: the
    /// bootstrap mints our id (`get_new_node_id`) before we can announce
    /// ourselves, unlike `handshake_connect` where both sides already know
    /// their id. Returns `(our new id, bootstrap's id)`.
    pub async fn handshake_join(stream: &mut TcpStream, my_port: u16) -> Result<(NodeId, NodeId)> {
        let placeholder = NodeId(0);
        send_request(stream, placeholder, &Message::BeginSession).await?;
        expect_done(stream, placeholder).await?;

        let my_node = match send_and_recv(
            stream,
            placeholder,
            &Message::GetNewNodeId { port: my_port },
        )
        .await?
        {
            Message::NewNodeId(id) => id,
            other => {
                return Err(TsMeshError::MalformedFrame(format!(
                    "expected new node id, got {other:?}"
                )))
            }
        };

        send_request(stream, my_node, &Message::MyNameIs(my_node.to_string())).await?;
        expect_done(stream, my_node).await?;

        let bootstrap_node = match send_and_recv(stream, my_node, &Message::GetNodeId).await? {
            Message::NodeIdReply(n) => n,
            other => {
                return Err(TsMeshError::MalformedFrame(format!(
                    "expected node id reply, got {other:?}"
                )))
            }
        };

        Ok((my_node, bootstrap_node))
    }

    /// Wraps a stream (post-handshake, either side) in a `Multiplexer` and
    /// records it as a direct neighbour.
    pub fn adopt_connection(
        &self,
        stream: TcpStream,
        peer_node: NodeId,
        inbound: mpsc::UnboundedSender<Frame>,
    ) -> Arc<Multiplexer> {
        let mux = Multiplexer::spawn(stream, self.my_node, peer_node, inbound);
        self.record_direct(peer_node, mux.clone());
        mux
    }

    /// Fire-and-forget broadcast to every direct neighbour (used for
    /// `unregister_process` notices and node-id discovery floods).
    pub async fn broadcast(&self, message: &Message, dst_port: i32) {
        let payload = match wire::encode(message) {
            Ok(p) => p,
            Err(_) => return,
        };
        for entry in self.links.iter() {
            let _ = entry.value().send(self.my_node, dst_port, &payload).await;
        }
    }

    /// Broadcasts `message` to direct neighbours and collects every reply
    /// (one-hop; neighbours that themselves re-broadcast on receipt extend
    /// the flood transitively through the dispatcher's own handling of the
    /// same opcode).
    pub async fn broadcast_collect(&self, message: &Message, dst_port: i32) -> Vec<Message> {
        let mut replies = Vec::new();
        for entry in self.links.iter() {
            if let Ok(reply) = entry
                .value()
                .send_and_wait(self.my_node, dst_port, message)
                .await
            {
                replies.push(reply);
            }
        }
        replies
    }
}

async fn send_request(stream: &mut TcpStream, my_node: NodeId, message: &Message) -> Result<()> {
    let payload = wire::encode(message)?;
    wire::write_frame(stream, 0, my_node.0 as i32, 0, 0, &payload).await
}

/// Sends a request and reads back the single reply frame expected to follow
/// it on this same connection (the handshake is strictly synchronous, one
/// message in flight at a time, so there is no tag to demultiplex yet).
async fn send_and_recv(stream: &mut TcpStream, my_node: NodeId, message: &Message) -> Result<Message> {
    send_request(stream, my_node, message).await?;
    let frame = wire::read_frame(stream).await?;
    wire::decode(&frame.payload)
}

async fn expect_done(stream: &mut TcpStream, _my_node: NodeId) -> Result<()> {
    let frame = wire::read_frame(stream).await?;
    match wire::decode(&frame.payload)? {
        Message::Done => Ok(()),
        other => Err(TsMeshError::MalformedFrame(format!(
            "expected done, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_route_is_not_overwritten_once_set() {
        let mesh = Mesh::new(NodeId(1));
        mesh.record_indirect(NodeId(5), NodeId(2));
        mesh.record_indirect(NodeId(5), NodeId(3));
        assert_eq!(mesh.route_for(NodeId(5)), Some(Route::Via(NodeId(2))));
    }

    #[test]
    fn self_has_no_route() {
        let mesh = Mesh::new(NodeId(1));
        assert!(mesh.route_for(NodeId(1)).is_none());
    }

    #[test]
    fn my_addr_is_settable_exactly_once() {
        let mesh = Mesh::new(NodeId(1));
        assert!(mesh.my_addr().is_none());
        mesh.set_my_addr("127.0.0.1:9700".to_string());
        mesh.set_my_addr("127.0.0.1:9999".to_string());
        assert_eq!(mesh.my_addr(), Some("127.0.0.1:9700"));
    }
}
