//! Distributed garbage collector (component H, GC half).
//!
//! Grounded on `tuplespace.py`'s `doGarbageCollection`: a BFS over the
//! `refs` graph starting at one tuplespace. Hitting a node id, a process id,
//! or the universal tuplespace anywhere in the walk proves liveness and
//! aborts; otherwise the visited set is a closed clique with no external
//! reachability and the originating tuplespace is emptied.

use crate::ids::{HolderId, TupleSpaceId};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use tracing::info;

/// Abstracts local-vs-remote graph reads so the walk itself doesn't care
/// which tuplespaces live on this node.
#[async_trait]
pub trait RefGraph: Send + Sync {
    async fn references_of(&self, ts: TupleSpaceId) -> Vec<HolderId>;
    /// Drops every tuple the (local) engine `ts` holds, releasing whatever
    /// nested tuplespace references those tuples carried, and removes `ts`
    /// from the registry.
    async fn empty_tuplespace(&self, ts: TupleSpaceId);
}

/// Runs the reachability walk starting at `start`. Returns whether `start`
/// was found unreachable from any root and consequently emptied.
pub async fn garbage_collect(start: TupleSpaceId, graph: &dyn RefGraph) -> bool {
    if start.is_universal() {
        return false;
    }

    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(HolderId::TupleSpace(start));
    queue.push_back(start);

    while let Some(ts) = queue.pop_front() {
        for holder in graph.references_of(ts).await {
            match holder {
                HolderId::Node(_) | HolderId::Process(_) => return false,
                HolderId::TupleSpace(next) => {
                    if next.is_universal() {
                        return false;
                    }
                    if visited.insert(HolderId::TupleSpace(next)) {
                        queue.push_back(next);
                    }
                }
            }
        }
    }

    info!(ts = %start, clique_size = visited.len(), "gc: closed clique, emptying");
    graph.empty_tuplespace(start).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeId;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockGraph {
        edges: HashMap<TupleSpaceId, Vec<HolderId>>,
        emptied: Mutex<Vec<TupleSpaceId>>,
    }

    #[async_trait]
    impl RefGraph for MockGraph {
        async fn references_of(&self, ts: TupleSpaceId) -> Vec<HolderId> {
            self.edges.get(&ts).cloned().unwrap_or_default()
        }
        async fn empty_tuplespace(&self, ts: TupleSpaceId) {
            self.emptied.lock().unwrap().push(ts);
        }
    }

    fn ts(seq: u64) -> TupleSpaceId {
        TupleSpaceId {
            node: NodeId(1),
            seq,
        }
    }

    #[tokio::test]
    async fn mutual_cycle_with_no_root_is_collected() {
        let x = ts(1);
        let y = ts(2);
        let mut edges = HashMap::new();
        edges.insert(x, vec![HolderId::TupleSpace(y)]);
        edges.insert(y, vec![HolderId::TupleSpace(x)]);
        let graph = MockGraph {
            edges,
            emptied: Mutex::new(Vec::new()),
        };
        assert!(garbage_collect(x, &graph).await);
        assert_eq!(*graph.emptied.lock().unwrap(), vec![x]);
    }

    #[tokio::test]
    async fn process_reference_keeps_it_live() {
        let x = ts(1);
        let mut edges = HashMap::new();
        edges.insert(
            x,
            vec![HolderId::Process(crate::ids::ProcessId {
                node: NodeId(1),
                seq: 0,
            })],
        );
        let graph = MockGraph {
            edges,
            emptied: Mutex::new(Vec::new()),
        };
        assert!(!garbage_collect(x, &graph).await);
        assert!(graph.emptied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn universal_tuplespace_is_never_collected() {
        let graph = MockGraph {
            edges: HashMap::new(),
            emptied: Mutex::new(Vec::new()),
        };
        assert!(!garbage_collect(TupleSpaceId::UNIVERSAL, &graph).await);
    }
}
