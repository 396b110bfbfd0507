//! Distributed deadlock detector (component H, deadlock half).
//!
//! Grounded on `tuplespace.py`'s `isDeadLocked`: starting at one engine,
//! enumerate processes and tuplespaces in its `refs`, every thread on each
//! process, and every thread blocked on each tuplespace in the clique. A
//! node-id holder or the universal tuplespace proves liveness; a thread not
//! found in any clique tuplespace's blocked list is "runnable" and also
//! proves liveness. Zero runnable threads (with at least one thread found
//! at all) means the clique is deadlocked.
//!
//! Resolves the spec's flagged `notblocked_process`/`notblocked_thread`
//! naming bug in the original by tracking exactly one `Vec<ThreadId>`
//! throughout, named for what it holds.

use crate::ids::{HolderId, ProcessId, ThreadId, TupleSpaceId};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};

#[async_trait]
pub trait DeadlockGraph: Send + Sync {
    async fn references_of(&self, ts: TupleSpaceId) -> Vec<HolderId>;
    async fn threads_of(&self, process: ProcessId) -> Vec<ThreadId>;
    async fn blocked_threads_of(&self, ts: TupleSpaceId) -> Vec<ThreadId>;
}

pub struct DeadlockScan {
    pub deadlocked: bool,
    /// Every tuplespace found in the clique; a caller breaking a detected
    /// deadlock may try `unblock_random` against any of them, since the
    /// `unblockable` waiter that breaks the cycle need not live on `start`.
    pub clique: Vec<TupleSpaceId>,
}

pub async fn scan(start: TupleSpaceId, graph: &dyn DeadlockGraph) -> DeadlockScan {
    if start.is_universal() {
        return DeadlockScan {
            deadlocked: false,
            clique: Vec::new(),
        };
    }

    let mut visited_ts = HashSet::new();
    let mut visited_process = HashSet::new();
    let mut queue = VecDeque::new();
    visited_ts.insert(start);
    queue.push_back(start);

    let mut threads: Vec<ThreadId> = Vec::new();

    while let Some(ts) = queue.pop_front() {
        for holder in graph.references_of(ts).await {
            match holder {
                HolderId::Node(_) => {
                    return DeadlockScan {
                        deadlocked: false,
                        clique: visited_ts.into_iter().collect(),
                    }
                }
                HolderId::Process(p) => {
                    if visited_process.insert(p) {
                        threads.extend(graph.threads_of(p).await);
                    }
                }
                HolderId::TupleSpace(next) => {
                    if next.is_universal() {
                        return DeadlockScan {
                            deadlocked: false,
                            clique: visited_ts.into_iter().collect(),
                        };
                    }
                    if visited_ts.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
    }

    let mut blocked_thread: HashSet<ThreadId> = HashSet::new();
    for ts in &visited_ts {
        blocked_thread.extend(graph.blocked_threads_of(*ts).await);
    }

    let notblocked_thread: Vec<ThreadId> = threads
        .iter()
        .copied()
        .filter(|t| !blocked_thread.contains(t))
        .collect();

    let deadlocked = !threads.is_empty() && notblocked_thread.is_empty();

    DeadlockScan {
        deadlocked,
        clique: visited_ts.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeId;
    use std::collections::HashMap;

    struct MockGraph {
        refs: HashMap<TupleSpaceId, Vec<HolderId>>,
        threads: HashMap<ProcessId, Vec<ThreadId>>,
        blocked: HashMap<TupleSpaceId, Vec<ThreadId>>,
    }

    #[async_trait]
    impl DeadlockGraph for MockGraph {
        async fn references_of(&self, ts: TupleSpaceId) -> Vec<HolderId> {
            self.refs.get(&ts).cloned().unwrap_or_default()
        }
        async fn threads_of(&self, process: ProcessId) -> Vec<ThreadId> {
            self.threads.get(&process).cloned().unwrap_or_default()
        }
        async fn blocked_threads_of(&self, ts: TupleSpaceId) -> Vec<ThreadId> {
            self.blocked.get(&ts).cloned().unwrap_or_default()
        }
    }

    fn ts(seq: u64) -> TupleSpaceId {
        TupleSpaceId {
            node: NodeId(1),
            seq,
        }
    }
    fn pid(seq: u64) -> ProcessId {
        ProcessId {
            node: NodeId(1),
            seq,
        }
    }
    fn tid(seq: u64, tseq: u64) -> ThreadId {
        ThreadId {
            node: NodeId(1),
            seq,
            tseq,
        }
    }

    #[tokio::test]
    async fn all_threads_blocked_is_deadlocked() {
        let t = ts(1);
        let p = pid(1);
        let th = tid(1, 1);
        let graph = MockGraph {
            refs: HashMap::from([(t, vec![HolderId::Process(p)])]),
            threads: HashMap::from([(p, vec![th])]),
            blocked: HashMap::from([(t, vec![th])]),
        };
        let result = scan(t, &graph).await;
        assert!(result.deadlocked);
    }

    #[tokio::test]
    async fn a_runnable_thread_prevents_deadlock() {
        let t = ts(1);
        let p = pid(1);
        let th = tid(1, 1);
        let graph = MockGraph {
            refs: HashMap::from([(t, vec![HolderId::Process(p)])]),
            threads: HashMap::from([(p, vec![th])]),
            blocked: HashMap::new(),
        };
        let result = scan(t, &graph).await;
        assert!(!result.deadlocked);
    }

    #[tokio::test]
    async fn node_root_prevents_deadlock() {
        let t = ts(1);
        let graph = MockGraph {
            refs: HashMap::from([(t, vec![HolderId::Node(NodeId(2))])]),
            threads: HashMap::new(),
            blocked: HashMap::new(),
        };
        let result = scan(t, &graph).await;
        assert!(!result.deadlocked);
    }

    #[tokio::test]
    async fn universal_tuplespace_never_deadlocks() {
        let graph = MockGraph {
            refs: HashMap::new(),
            threads: HashMap::new(),
            blocked: HashMap::new(),
        };
        let result = scan(TupleSpaceId::UNIVERSAL, &graph).await;
        assert!(!result.deadlocked);
    }
}
