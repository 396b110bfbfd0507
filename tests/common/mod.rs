//! Shared harness for the multi-node scenarios in `tests/`: each "node"
//! is a real `Node` behind a real `TcpListener` on `127.0.0.1:0`, and
//! "clients" are bare `TcpStream`s speaking the wire protocol directly,
//! mirroring how an actual client process would.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tsmesh::config::PeerAllowList;
use tsmesh::dispatcher;
use tsmesh::ids::NodeId;
use tsmesh::node::Node;
use tsmesh::wire::{self, Message};

pub struct TestNode {
    pub node: Arc<Node>,
    pub addr: SocketAddr,
}

/// Founds a node, binds its listener, and spawns its accept loop.
pub async fn spawn_node(id: u64) -> TestNode {
    let node = Node::new(NodeId(id));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    node.mesh.set_my_addr(addr.to_string());

    let accept_node = node.clone();
    tokio::spawn(async move {
        let allow_list = PeerAllowList::parse(&[]).unwrap();
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => break,
            };
            let node = accept_node.clone();
            let allow_list = allow_list.clone();
            tokio::spawn(async move {
                let _ = dispatcher::run_connection(node, stream, peer_addr, &allow_list).await;
            });
        }
    });

    TestNode { node, addr }
}

/// Opens a direct peer link from `from` to `to` and waits for the join to
/// settle before returning.
pub async fn link(from: &TestNode, to: &TestNode) {
    dispatcher::connect_out(&from.node, &to.addr.to_string())
        .await
        .unwrap();
}

/// Brings up a brand-new node the way `tsmeshd`'s `--connect` path does:
/// dials `bootstrap`, runs the join handshake to get an id minted for it,
/// and adopts the resulting link, rather than founding with a known id.
pub async fn join(bootstrap: &TestNode) -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut stream = TcpStream::connect(bootstrap.addr).await.unwrap();
    let (my_id, bootstrap_id) =
        tsmesh::mesh::Mesh::handshake_join(&mut stream, addr.port())
            .await
            .unwrap();
    let node = Node::new(my_id);
    node.observe_node_id(bootstrap_id);
    node.mesh.set_my_addr(addr.to_string());

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let mux = node.mesh.adopt_connection(stream, bootstrap_id, inbound_tx);
    tokio::spawn(dispatcher::run_peer_inbound_loop(node.clone(), mux, inbound_rx));

    let accept_node = node.clone();
    tokio::spawn(async move {
        let allow_list = PeerAllowList::parse(&[]).unwrap();
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => break,
            };
            let node = accept_node.clone();
            let allow_list = allow_list.clone();
            tokio::spawn(async move {
                let _ = dispatcher::run_connection(node, stream, peer_addr, &allow_list).await;
            });
        }
    });

    TestNode { node, addr }
}

/// A bare client connection: connects once, round-trips one request at a
/// time. Kept open across calls so a blocking request (`rd`/`in` with no
/// immediate match) can be replied to later on the same socket.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Client {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    pub async fn request(&mut self, message: &Message) -> Message {
        let payload = wire::encode(message).unwrap();
        wire::write_frame(&mut self.stream, 0, 0, 0, 0, &payload)
            .await
            .unwrap();
        let frame = wire::read_frame(&mut self.stream).await.unwrap();
        wire::decode(&frame.payload).unwrap()
    }
}
