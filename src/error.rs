//! Error types for the tuplespace runtime.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TsMeshError>;

#[derive(Error, Debug)]
pub enum TsMeshError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("unknown identifier shape: {0}")]
    BadIdentifier(String),

    #[error("no such tuplespace: {0}")]
    NoSuchTupleSpace(String),

    #[error("peer {node} unreachable")]
    PeerUnreachable { node: u64 },

    #[error("connection to node {node} dropped")]
    ConnectionDropped { node: u64 },

    #[error("peer {addr} not permitted by allow-list")]
    NotPermitted { addr: String },

    #[error("reference count went negative for {id}")]
    ReferenceInconsistency { id: String },

    #[error("blocked-set invariant violated for {id}: {detail}")]
    BlockedSetInvariant { id: String, detail: String },

    #[error("counter {name} exhausted its range")]
    CounterExhausted { name: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("channel send error")]
    ChannelSend,

    #[error("channel receive error")]
    ChannelReceive,
}

impl TsMeshError {
    /// True for conditions the mesh should route around rather than abort on
    /// (a dead peer, an unreachable node) — matches the "transport error"
    /// category.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TsMeshError::PeerUnreachable { .. }
                | TsMeshError::ConnectionDropped { .. }
                | TsMeshError::Io(_)
        )
    }

    /// True for conditions that indicate a broken invariant rather than an
    /// ordinary runtime condition; these should be logged at error level and
    /// the offending operation aborted rather than retried.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            TsMeshError::ReferenceInconsistency { .. } | TsMeshError::BlockedSetInvariant { .. }
        )
    }

    pub fn node_id(&self) -> Option<u64> {
        match self {
            TsMeshError::PeerUnreachable { node } | TsMeshError::ConnectionDropped { node } => {
                Some(*node)
            }
            _ => None,
        }
    }
}
