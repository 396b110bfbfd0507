//! Message dispatcher (component G): per-connection opcode handling.
//!
//! Grounded on `server.py`'s `LindaConnection`/`kernel.py`'s `_Process`
//! dispatch loop, reimagined as a `match` over [`crate::wire::Message`]
//! rather than a string-keyed handler table — the enum match already is the
//! idiomatic equivalent.
//!
//! A connection is one of two kinds, decided by its first frame: a plain
//! client (a process issuing `register_process`/`out`/`rd`/...) gets a raw
//! per-connection loop that replies directly on the socket; a peer opening
//! with `begin_session` gets wrapped in a [`crate::multiplexer::Multiplexer`]
//! on both ends so either side can later issue tagged request/reply traffic
//! and forwarded opcodes over the same link.

use crate::config::PeerAllowList;
use crate::error::{Result, TsMeshError};
use crate::ids::NodeId;
use crate::mesh::Mesh;
use crate::multiplexer::Multiplexer;
use crate::node::Node;
use crate::wire::{self, Frame, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// A handle back to one frame's sender: either a raw per-connection writer
/// (client sessions) or a multiplexed link replying with the original
/// frame's sequence number (peer sessions), so a detached task resolving a
/// blocking wait later can reply without re-deriving the header.
#[derive(Clone)]
pub enum ReplyTarget {
    Raw {
        write: Arc<Mutex<WriteHalf<TcpStream>>>,
        dst_node: i32,
        src_node: i32,
        dst_port: i32,
        seq: i32,
    },
    Mux {
        mux: Arc<Multiplexer>,
        my_node: NodeId,
        dst_port: i32,
        seq: i32,
    },
}

impl ReplyTarget {
    pub async fn send(&self, message: &Message) -> Result<()> {
        let payload = wire::encode(message)?;
        match self {
            ReplyTarget::Raw {
                write,
                dst_node,
                src_node,
                dst_port,
                seq,
            } => {
                let mut w = write.lock().await;
                wire::write_frame(&mut *w, *dst_node, *src_node, *dst_port, *seq, &payload).await
            }
            ReplyTarget::Mux {
                mux,
                my_node,
                dst_port,
                seq,
            } => mux.reply(*my_node, *dst_port, *seq, &payload).await,
        }
    }
}

/// Accepts one incoming TCP connection, decides whether it is a client or a
/// peer by its first frame, and runs the matching loop until the connection
/// closes.
pub async fn run_connection(
    node: Arc<Node>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    allow_list: &PeerAllowList,
) -> Result<()> {
    if let SocketAddr::V4(v4) = peer_addr {
        if !allow_list.allows(*v4.ip()) {
            return Err(TsMeshError::NotPermitted {
                addr: peer_addr.to_string(),
            });
        }
    }

    let first = wire::read_frame(&mut stream).await?;
    let first_message = wire::decode(&first.payload)?;

    if matches!(first_message, Message::BeginSession) {
        let peer_node = finish_peer_handshake(&mut stream, &node, &first).await?;
        info!(peer = %peer_addr, node = %peer_node, "dispatcher: accepted peer link");
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mux = node.mesh.adopt_connection(stream, peer_node, inbound_tx);
        run_peer_inbound_loop(node, mux, inbound_rx).await;
        return Ok(());
    }

    run_client_session(node, stream, peer_addr, first).await
}

/// Finishes the accept-side handshake after `begin_session`. The second
/// frame tells us which of the two protocols the dialer is speaking:
/// `get_node_id` is an established node running the ordinary peer handshake
/// (`Mesh::handshake_connect`), `get_new_node_id` is a brand-new node
/// joining the mesh (`Mesh::handshake_join`), which doesn't know its own id
/// yet and so asks for `get_node_id` last instead of first.
async fn finish_peer_handshake(stream: &mut TcpStream, node: &Node, first: &Frame) -> Result<NodeId> {
    let payload = wire::encode(&Message::Done)?;
    wire::write_frame(stream, first.header.src_node, node.id.0 as i32, 0, first.header.seq, &payload)
        .await?;

    let frame = wire::read_frame(stream).await?;
    match wire::decode(&frame.payload)? {
        Message::GetNodeId => {
            let payload = wire::encode(&Message::NodeIdReply(node.id))?;
            wire::write_frame(stream, frame.header.src_node, node.id.0 as i32, 0, frame.header.seq, &payload)
                .await?;

            let frame = wire::read_frame(stream).await?;
            let peer_node = match wire::decode(&frame.payload)? {
                Message::MyNameIs(name) => NodeId::parse(&name)?,
                other => {
                    return Err(TsMeshError::MalformedFrame(format!(
                        "expected my_name_is, got {other:?}"
                    )))
                }
            };
            let payload = wire::encode(&Message::Done)?;
            wire::write_frame(stream, frame.header.src_node, node.id.0 as i32, 0, frame.header.seq, &payload)
                .await?;
            node.observe_node_id(peer_node);
            Ok(peer_node)
        }
        Message::GetNewNodeId { port: _port } => {
            let assigned = node.next_node_id();
            let payload = wire::encode(&Message::NewNodeId(assigned))?;
            wire::write_frame(stream, frame.header.src_node, node.id.0 as i32, 0, frame.header.seq, &payload)
                .await?;

            let frame = wire::read_frame(stream).await?;
            let peer_node = match wire::decode(&frame.payload)? {
                Message::MyNameIs(name) => NodeId::parse(&name)?,
                other => {
                    return Err(TsMeshError::MalformedFrame(format!(
                        "expected my_name_is, got {other:?}"
                    )))
                }
            };
            let payload = wire::encode(&Message::Done)?;
            wire::write_frame(stream, frame.header.src_node, node.id.0 as i32, 0, frame.header.seq, &payload)
                .await?;

            let frame = wire::read_frame(stream).await?;
            match wire::decode(&frame.payload)? {
                Message::GetNodeId => {
                    let payload = wire::encode(&Message::NodeIdReply(node.id))?;
                    wire::write_frame(stream, frame.header.src_node, node.id.0 as i32, 0, frame.header.seq, &payload)
                        .await?;
                }
                other => {
                    return Err(TsMeshError::MalformedFrame(format!(
                        "expected get_node_id, got {other:?}"
                    )))
                }
            }
            Ok(peer_node)
        }
        other => Err(TsMeshError::MalformedFrame(format!(
            "expected get_node_id or get_new_node_id, got {other:?}"
        ))),
    }
}

/// Drains frames a peer's `Multiplexer` forwarded because they didn't match
/// an outstanding `send_and_wait`, dispatching each and replying with the
/// original sequence number so the peer's own `send_and_wait` resolves.
pub async fn run_peer_inbound_loop(
    node: Arc<Node>,
    mux: Arc<Multiplexer>,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = inbound.recv().await {
        let reply = ReplyTarget::Mux {
            mux: mux.clone(),
            my_node: node.id,
            dst_port: frame.header.dst_port,
            seq: frame.header.seq,
        };
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = dispatch(&node, &frame, &reply).await {
                warn!(peer = %mux.peer_node, error = %err, "peer inbound: error handling frame");
            }
        });
    }
    node.mesh.drop_neighbour(mux.peer_node);
    info!(peer = %mux.peer_node, "dispatcher: peer link closed");
}

async fn run_client_session(
    node: Arc<Node>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    first: Frame,
) -> Result<()> {
    let (mut read_half, write_half) = tokio::io::split(stream);
    let write = Arc::new(Mutex::new(write_half));

    let mut frame = first;
    loop {
        let reply = ReplyTarget::Raw {
            write: write.clone(),
            dst_node: frame.header.src_node,
            src_node: frame.header.dst_node,
            dst_port: frame.header.dst_port,
            seq: frame.header.seq,
        };
        if let Err(err) = dispatch(&node, &frame, &reply).await {
            warn!(peer = %peer_addr, error = %err, "session: error handling frame");
            if !err.is_recoverable() {
                let _ = reply.send(&Message::No).await;
            }
        }
        frame = match wire::read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(err) => {
                info!(peer = %peer_addr, error = %err, "session: connection closed");
                return Ok(());
            }
        };
    }
}

async fn dispatch(node: &Arc<Node>, frame: &Frame, reply: &ReplyTarget) -> Result<()> {
    let message = wire::decode(&frame.payload)?;
    match message {
        Message::BeginSession => reply.send(&Message::Done).await,

        Message::GetNodeId => reply.send(&Message::NodeIdReply(node.id)).await,

        Message::MyNameIs(_peer_name) => reply.send(&Message::Done).await,

        Message::CloseConnection => Ok(()),

        Message::GetNewNodeId { port: _port } => {
            let assigned = node.next_node_id();
            reply.send(&Message::NewNodeId(assigned)).await
        }

        Message::RegisterProcess => {
            let pid = node.register_process()?;
            reply.send(&Message::ProcessRegistered(pid)).await
        }

        Message::RegisterThread(pid) => {
            let tid = node.register_thread(pid)?;
            reply.send(&Message::ThreadRegistered(tid)).await
        }

        Message::UnregisterThread(tid) => {
            node.unregister_thread(tid);
            reply.send(&Message::Done).await
        }

        Message::UnregisterProcess(pid) => {
            node.on_process_gone(pid).await;
            reply.send(&Message::Done).await
        }

        Message::CreateTupleSpace => {
            let ts = node.create_tuplespace()?;
            reply.send(&Message::TupleSpaceCreated(ts)).await
        }

        Message::OutTuple { ts, tuple } => {
            node.out(ts, tuple).await?;
            reply.send(&Message::Done).await
        }

        Message::ReadTuple {
            ts,
            template,
            thread,
            unblockable,
        } => {
            node.read_or_take(ts, template, thread, unblockable, false, reply.clone())
                .await
        }

        Message::InTuple {
            ts,
            template,
            thread,
            unblockable,
        } => {
            node.read_or_take(ts, template, thread, unblockable, true, reply.clone())
                .await
        }

        Message::Collect { src, dst, template } => {
            let n = node.collect(src, dst, template, true).await?;
            reply.send(&Message::Count(n)).await
        }

        Message::CopyCollect { src, dst, template } => {
            let n = node.collect(src, dst, template, false).await?;
            reply.send(&Message::Count(n)).await
        }

        Message::MultipleIn { ts, tuples } => {
            node.multiple_in(ts, tuples).await?;
            reply.send(&Message::Done).await
        }

        Message::IncrementRef { ts, holder } => {
            node.increment_ref(ts, holder).await?;
            reply.send(&Message::Done).await
        }

        Message::DecrementRef { ts, holder } => {
            node.decrement_ref(ts, holder).await?;
            reply.send(&Message::Done).await
        }

        Message::GetReferences(ts) => {
            let refs = node.local_references(ts)?;
            reply.send(&Message::References(refs)).await
        }

        Message::GetBlockedList(ts) => {
            let list = node.local_blocked_list(ts)?;
            reply.send(&Message::BlockedList(list)).await
        }

        Message::GetThreads(pid) => {
            let threads = node.threads_of_local_process(pid);
            reply.send(&Message::Threads(threads)).await
        }

        Message::GetNeighbours => {
            reply
                .send(&Message::Neighbours(node.mesh.neighbour_table()))
                .await
        }

        Message::GetConnectDetails(target) => match node.connect_details_for(target).await {
            Some((addr, via)) => reply.send(&Message::ConnectDetails { addr, via }).await,
            None => reply.send(&Message::No).await,
        },

        Message::KillServer => {
            warn!("received kill_server; ignoring (no remote shutdown in this deployment)");
            reply.send(&Message::Done).await
        }

        other => Err(TsMeshError::MalformedFrame(format!(
            "unexpected message in session context: {other:?}"
        ))),
    }
}

/// Dials `addr`, performs the join handshake (minting our node id if we
/// don't have one yet) or the ordinary peer handshake (if we do), and
/// returns the adopted link.
pub async fn connect_out(node: &Arc<Node>, addr: &str) -> Result<(NodeId, Arc<Multiplexer>)> {
    let mut stream = TcpStream::connect(addr).await?;
    let peer_node = Mesh::handshake_connect(&mut stream, node.id, None).await?;
    node.observe_node_id(peer_node);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let mux = node.mesh.adopt_connection(stream, peer_node, inbound_tx);
    tokio::spawn(run_peer_inbound_loop(node.clone(), mux.clone(), inbound_rx));
    Ok((peer_node, mux))
}
