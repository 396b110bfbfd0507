//! Identity & routing helpers (component D).
//!
//! All ids are textual with a fixed shape: node id is a bare positive
//! integer (`0` aliases the founder, node `1`); tuplespace id is
//! `"<node>:<seq>"`; process id is `"<node>!<seq>"`; thread id is
//! `"<node>!<seq>!<tseq>"`.

use crate::error::{Result, TsMeshError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node in the mesh. `FOUNDER` is node `1`; the literal `0` a peer may send
/// always normalizes to it at parse time, so no call site downstream needs
/// to special-case `0` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const FOUNDER: NodeId = NodeId(1);

    pub fn parse(raw: &str) -> Result<Self> {
        let n: u64 = raw
            .parse()
            .map_err(|_| TsMeshError::BadIdentifier(raw.to_string()))?;
        Ok(Self::normalize(n))
    }

    pub fn normalize(n: u64) -> Self {
        if n == 0 {
            NodeId::FOUNDER
        } else {
            NodeId(n)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleSpaceId {
    pub node: NodeId,
    pub seq: u64,
}

impl TupleSpaceId {
    /// `"0:0"`, normalized — always live, never GCed, cannot deadlock.
    pub const UNIVERSAL: TupleSpaceId = TupleSpaceId {
        node: NodeId(0),
        seq: 0,
    };

    pub fn is_universal(&self) -> bool {
        self.node.0 == 0 && self.seq == 0
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let (node, seq) = split_two(raw, ':')?;
        if node == 0 && seq == 0 {
            return Ok(TupleSpaceId::UNIVERSAL);
        }
        Ok(TupleSpaceId {
            node: NodeId::normalize(node),
            seq,
        })
    }

    pub fn owning_node(&self) -> NodeId {
        if self.is_universal() {
            NodeId::FOUNDER
        } else {
            self.node
        }
    }
}

impl fmt::Display for TupleSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_universal() {
            write!(f, "0:0")
        } else {
            write!(f, "{}:{}", self.node, self.seq)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    pub node: NodeId,
    pub seq: u64,
}

impl ProcessId {
    pub fn parse(raw: &str) -> Result<Self> {
        let (node, seq) = split_two(raw, '!')?;
        Ok(ProcessId {
            node: NodeId::normalize(node),
            seq,
        })
    }

    pub fn owning_node(&self) -> NodeId {
        self.node
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.node, self.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId {
    pub node: NodeId,
    pub seq: u64,
    pub tseq: u64,
}

impl ThreadId {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, '!');
        let node = parts
            .next()
            .ok_or_else(|| TsMeshError::BadIdentifier(raw.to_string()))?;
        let seq = parts
            .next()
            .ok_or_else(|| TsMeshError::BadIdentifier(raw.to_string()))?;
        let tseq = parts
            .next()
            .ok_or_else(|| TsMeshError::BadIdentifier(raw.to_string()))?;
        if parts.next().is_some() {
            return Err(TsMeshError::BadIdentifier(raw.to_string()));
        }
        let node: u64 = node
            .parse()
            .map_err(|_| TsMeshError::BadIdentifier(raw.to_string()))?;
        let seq: u64 = seq
            .parse()
            .map_err(|_| TsMeshError::BadIdentifier(raw.to_string()))?;
        let tseq: u64 = tseq
            .parse()
            .map_err(|_| TsMeshError::BadIdentifier(raw.to_string()))?;
        Ok(ThreadId {
            node: NodeId::normalize(node),
            seq,
            tseq,
        })
    }

    pub fn owning_node(&self) -> NodeId {
        self.node
    }

    pub fn process_id(&self) -> ProcessId {
        ProcessId {
            node: self.node,
            seq: self.seq,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}!{}", self.node, self.seq, self.tseq)
    }
}

/// Any id that can appear as a `refs` entry: a node, a process, or another
/// tuplespace. Thread-ids are never valid holders (per-engine invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HolderId {
    Node(NodeId),
    Process(ProcessId),
    TupleSpace(TupleSpaceId),
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HolderId::Node(n) => write!(f, "{n}"),
            HolderId::Process(p) => write!(f, "{p}"),
            HolderId::TupleSpace(t) => write!(f, "{t}"),
        }
    }
}

fn split_two(raw: &str, sep: char) -> Result<(u64, u64)> {
    let mut parts = raw.splitn(2, sep);
    let a = parts
        .next()
        .ok_or_else(|| TsMeshError::BadIdentifier(raw.to_string()))?;
    let b = parts
        .next()
        .ok_or_else(|| TsMeshError::BadIdentifier(raw.to_string()))?;
    let a: u64 = a
        .parse()
        .map_err(|_| TsMeshError::BadIdentifier(raw.to_string()))?;
    let b: u64 = b
        .parse()
        .map_err(|_| TsMeshError::BadIdentifier(raw.to_string()))?;
    Ok((a, b))
}

/// Thread-safe monotonic counter, optionally capped (mirrors the original
/// `Counter` helper used to mint process/tuplespace/thread sequence
/// numbers).
pub struct Counter {
    next: parking_lot::Mutex<u64>,
    limit: Option<u64>,
    name: &'static str,
}

impl Counter {
    pub fn new(name: &'static str) -> Self {
        Counter {
            next: parking_lot::Mutex::new(0),
            limit: None,
            name,
        }
    }

    pub fn with_limit(name: &'static str, limit: u64) -> Self {
        Counter {
            next: parking_lot::Mutex::new(0),
            limit: Some(limit),
            name,
        }
    }

    pub fn next(&self) -> Result<u64> {
        let mut guard = self.next.lock();
        if let Some(limit) = self.limit {
            if *guard >= limit {
                return Err(TsMeshError::CounterExhausted {
                    name: self.name.to_string(),
                });
            }
        }
        let v = *guard;
        *guard += 1;
        Ok(v)
    }
}
