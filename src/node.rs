//! Per-node orchestrator: owns the registry, mesh, and counters, and wires
//! component B/C/F/H together for the dispatcher. Mirrors the global
//! per-node state named in the design: `registry`, `neighbours` (held by
//! [`crate::mesh::Mesh`]), and the process/thread maps below.

use crate::deadlock::{self, DeadlockGraph};
use crate::dispatcher::ReplyTarget;
use crate::engine::{Engine, MatchOrWait, WaiterOutcome};
use crate::error::{Result, TsMeshError};
use crate::gc::{self, RefGraph};
use crate::ids::{Counter, HolderId, NodeId, ProcessId, ThreadId, TupleSpaceId};
use crate::mesh::Mesh;
use crate::registry::Registry;
use crate::value::{Template, Tuple};
use crate::wire::{BlockedWaiterInfo, Message, Route};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// The distinct tuplespaces `tuple` embeds, for crediting or releasing the
/// container holding it as a holder of each.
fn nested_ids_of(tuple: &Tuple) -> HashSet<TupleSpaceId> {
    let mut ids = HashSet::new();
    for element in tuple {
        element.walk_tuplespace_refs(&mut |nested| {
            ids.insert(nested);
        });
    }
    ids
}

pub struct Node {
    pub id: NodeId,
    pub registry: Arc<Registry>,
    pub mesh: Arc<Mesh>,
    process_counter: Counter,
    ts_counter: Counter,
    thread_counter: Counter,
    /// Threads registered under each process, for `get_threads` and
    /// disconnect cleanup.
    processes: DashMap<ProcessId, HashSet<ThreadId>>,
    /// Which tuplespace a thread is currently parked on, if any; used to
    /// drop its waiter entry if the client disconnects mid-wait.
    blocked_on: DashMap<ThreadId, TupleSpaceId>,
    /// Highest node id this node has assigned or observed, for minting the
    /// next joiner's id as `max + 1`.
    max_node_id: parking_lot::Mutex<u64>,
}

impl Node {
    pub fn new(id: NodeId) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        registry.new_tuplespace(TupleSpaceId::UNIVERSAL);
        Arc::new(Node {
            id,
            registry,
            mesh: Arc::new(Mesh::new(id)),
            process_counter: Counter::new("process"),
            ts_counter: Counter::new("tuplespace"),
            thread_counter: Counter::new("thread"),
            processes: DashMap::new(),
            blocked_on: DashMap::new(),
            max_node_id: parking_lot::Mutex::new(id.0),
        })
    }

    /// Mints the next unused node id (current known max + 1) for a joiner,
    /// recording it as the new max.
    pub fn next_node_id(&self) -> NodeId {
        let mut max = self.max_node_id.lock();
        *max += 1;
        NodeId(*max)
    }

    /// Folds a newly observed node id (one we've just joined as, or a peer
    /// that announced itself) into the running max, so `next_node_id` never
    /// hands out one already in use.
    pub fn observe_node_id(&self, id: NodeId) {
        let mut max = self.max_node_id.lock();
        if id.0 > *max {
            *max = id.0;
        }
    }

    pub fn register_process(&self) -> Result<ProcessId> {
        let seq = self.process_counter.next()?;
        let pid = ProcessId { node: self.id, seq };
        self.processes.insert(pid, HashSet::new());
        Ok(pid)
    }

    pub fn register_thread(&self, pid: ProcessId) -> Result<ThreadId> {
        let tseq = self.thread_counter.next()?;
        let tid = ThreadId {
            node: self.id,
            seq: pid.seq,
            tseq,
        };
        self.processes.entry(pid).or_default().insert(tid);
        Ok(tid)
    }

    pub fn unregister_thread(&self, tid: ThreadId) {
        if let Some(mut threads) = self.processes.get_mut(&tid.process_id()) {
            threads.remove(&tid);
        }
        self.blocked_on.remove(&tid);
    }

    pub fn threads_of_local_process(&self, pid: ProcessId) -> Vec<ThreadId> {
        self.processes
            .get(&pid)
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn create_tuplespace(&self) -> Result<TupleSpaceId> {
        let seq = self.ts_counter.next()?;
        let id = TupleSpaceId { node: self.id, seq };
        self.registry.new_tuplespace(id);
        Ok(id)
    }

    fn local_engine(&self, ts: TupleSpaceId) -> Result<Arc<Engine>> {
        self.registry
            .get(ts)
            .ok_or_else(|| TsMeshError::NoSuchTupleSpace(ts.to_string()))
    }

    pub async fn out(self: &Arc<Self>, ts: TupleSpaceId, tuple: Tuple) -> Result<()> {
        if ts.owning_node() != self.id {
            self.forward(ts.owning_node(), Message::OutTuple { ts, tuple })
                .await?;
            return Ok(());
        }
        let nested_ids = nested_ids_of(&tuple);
        let engine = self.local_engine(ts)?;
        engine.out(tuple);
        for nested in nested_ids {
            self.increment_ref(nested, HolderId::TupleSpace(ts)).await?;
        }
        Ok(())
    }

    /// Handles `read_tuple`/`in_tuple` (and, via `unblockable=true`, the
    /// principled `rdp`/`inp` forms): local match, local block with an
    /// immediate deadlock check, or forward to the owning node.
    pub async fn read_or_take(
        self: &Arc<Self>,
        ts: TupleSpaceId,
        template: Template,
        thread: ThreadId,
        unblockable: bool,
        destructive: bool,
        reply: ReplyTarget,
    ) -> Result<()> {
        if ts.owning_node() != self.id {
            let message = if destructive {
                Message::InTuple {
                    ts,
                    template,
                    thread,
                    unblockable,
                }
            } else {
                Message::ReadTuple {
                    ts,
                    template,
                    thread,
                    unblockable,
                }
            };
            let node = self.clone();
            tokio::spawn(async move {
                match node.forward(ts.owning_node(), message).await {
                    Ok(m) => {
                        let _ = reply.send(&m).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "forwarded blocking op failed");
                    }
                }
            });
            return Ok(());
        }

        let engine = self.local_engine(ts)?;
        let outcome = if destructive {
            engine.in_(thread, template, unblockable)
        } else {
            engine.rd(thread, template, unblockable)
        };

        match outcome {
            MatchOrWait::Matched(tuple) => {
                reply.send(&Message::TupleReply(tuple)).await?;
            }
            MatchOrWait::Waiting(rx) => {
                self.blocked_on.insert(thread, ts);
                let node = self.clone();
                tokio::spawn(async move {
                    node.check_deadlock(ts).await;
                    let outcome = rx.await;
                    node.blocked_on.remove(&thread);
                    match outcome {
                        Ok(WaiterOutcome::Delivered(tuple)) => {
                            let _ = reply.send(&Message::TupleReply(tuple)).await;
                        }
                        Ok(WaiterOutcome::Unblocked) => {
                            let _ = reply.send(&Message::Unblock).await;
                        }
                        Err(_) => {
                            // client disconnected before being served
                        }
                    }
                });
            }
        }
        Ok(())
    }

    pub async fn collect(
        self: &Arc<Self>,
        src: TupleSpaceId,
        dst: TupleSpaceId,
        template: Template,
        destructive: bool,
    ) -> Result<u64> {
        if src.owning_node() != self.id {
            let message = if destructive {
                Message::Collect { src, dst, template }
            } else {
                Message::CopyCollect { src, dst, template }
            };
            return match self.forward(src.owning_node(), message).await? {
                Message::Count(n) => Ok(n),
                other => Err(TsMeshError::MalformedFrame(format!(
                    "expected count reply, got {other:?}"
                ))),
            };
        }

        let engine = self.local_engine(src)?;
        let tuples = if destructive {
            engine.collect(&template)
        } else {
            engine.copy_collect(&template)
        };
        let count = tuples.len() as u64;

        // A destructive collect dismantles the edges the drained tuples'
        // embedded refs held to `src`, mirroring `empty_tuplespace`'s
        // release bookkeeping; `copy_collect` leaves the originals (and
        // their refs) in place.
        if destructive {
            let mut nested_ids = Vec::new();
            for tuple in &tuples {
                nested_ids.extend(nested_ids_of(tuple));
            }
            for nested in nested_ids {
                self.decrement_ref(nested, HolderId::TupleSpace(src)).await?;
            }
        }

        self.multiple_in(dst, tuples).await?;
        Ok(count)
    }

    pub async fn multiple_in(self: &Arc<Self>, ts: TupleSpaceId, tuples: Vec<Tuple>) -> Result<()> {
        if ts.owning_node() != self.id {
            self.forward(ts.owning_node(), Message::MultipleIn { ts, tuples })
                .await?;
            return Ok(());
        }
        let engine = self.local_engine(ts)?;
        // Mirrors `out`'s one-increment-per-tuple-per-distinct-id
        // bookkeeping: these tuples establish a fresh edge to `ts` just as
        // if each had been `out`'d individually.
        let mut nested_ids = Vec::new();
        for tuple in &tuples {
            nested_ids.extend(nested_ids_of(tuple));
        }
        for t in tuples {
            engine.out(t);
        }
        for nested in nested_ids {
            self.increment_ref(nested, HolderId::TupleSpace(ts)).await?;
        }
        Ok(())
    }

    pub async fn increment_ref(
        self: &Arc<Self>,
        ts: TupleSpaceId,
        holder: HolderId,
    ) -> Result<()> {
        if ts.owning_node() != self.id {
            return self
                .forward(ts.owning_node(), Message::IncrementRef { ts, holder })
                .await
                .map(|_| ());
        }
        self.local_engine(ts)?.add_reference(holder);
        Ok(())
    }

    /// Removes one reference and, regardless of the resulting count, kicks
    /// off a detached GC walk: a simple zero-count deletion can't catch a
    /// closed cycle of tuplespaces referencing only each other.
    pub async fn decrement_ref(self: &Arc<Self>, ts: TupleSpaceId, holder: HolderId) -> Result<()> {
        if ts.owning_node() != self.id {
            return self
                .forward(ts.owning_node(), Message::DecrementRef { ts, holder })
                .await
                .map(|_| ());
        }
        self.registry.delete_reference(ts, holder)?;
        let node = self.clone();
        tokio::spawn(async move {
            let graph = NodeGraph { node: node.clone() };
            gc::garbage_collect(ts, &graph).await;
        });
        Ok(())
    }

    /// A garbage-collected or never-created id reports no references rather
    /// than an error: from a caller's point of view "gone" and "never had
    /// any holders" are the same observable fact.
    pub fn local_references(&self, ts: TupleSpaceId) -> Result<Vec<HolderId>> {
        Ok(self
            .registry
            .get(ts)
            .map(|e| e.refs_snapshot())
            .unwrap_or_default())
    }

    pub fn local_blocked_list(&self, ts: TupleSpaceId) -> Result<Vec<BlockedWaiterInfo>> {
        let Some(engine) = self.registry.get(ts) else {
            return Ok(Vec::new());
        };
        Ok(engine
            .blocked_snapshot()
            .into_iter()
            .map(|b| BlockedWaiterInfo {
                thread: b.thread,
                unblockable: b.unblockable,
                destructive: b.destructive,
            })
            .collect())
    }

    async fn check_deadlock(self: &Arc<Self>, start: TupleSpaceId) {
        let graph = NodeGraph {
            node: self.clone(),
        };
        let result = deadlock::scan(start, &graph).await;
        if result.deadlocked {
            info!(ts = %start, "deadlock detected, releasing one unblockable waiter");
            for ts in result.clique {
                if ts.owning_node() == self.id {
                    if let Some(engine) = self.registry.get(ts) {
                        if engine.unblock_random() {
                            break;
                        }
                    }
                } else if self.remote_unblock_random(ts).await {
                    break;
                }
            }
        }
    }

    /// Best-effort remote unblock: asks the owning node to release one
    /// unblockable waiter on `ts` by forwarding a synthetic decrement-style
    /// probe is not meaningful here, so this relies on the owning node's own
    /// scan firing instead; kept as a hook for symmetry and logged at trace
    /// level when skipped.
    async fn remote_unblock_random(&self, ts: TupleSpaceId) -> bool {
        tracing::trace!(ts = %ts, "deadlock clique extends to a remote tuplespace; its own node's scan will recover it");
        false
    }

    pub async fn on_process_gone(self: &Arc<Self>, pid: ProcessId) {
        let threads = self
            .processes
            .remove(&pid)
            .map(|(_, t)| t)
            .unwrap_or_default();
        for tid in threads {
            if let Some((_, ts)) = self.blocked_on.remove(&tid) {
                if let Some(engine) = self.registry.get(ts) {
                    engine.remove_waiter(tid);
                }
            }
        }
        for ts in self.registry.ids() {
            self.registry
                .delete_all_references(ts, HolderId::Process(pid));
        }
        self.mesh
            .broadcast(&Message::UnregisterProcess(pid), 0)
            .await;
    }

    pub async fn forward(self: &Arc<Self>, node: NodeId, message: Message) -> Result<Message> {
        let link = self
            .mesh
            .link_toward(node)
            .ok_or(TsMeshError::PeerUnreachable { node: node.0 })?;
        link.send_and_wait(self.id, 0, &message).await
    }

    /// Resolves how a third party should reach `target`: our own dial-in
    /// address if they're asking about us, otherwise asks `target` (over
    /// our best existing route to it) for its address and reports the node
    /// to connect through — ourselves if our route is direct, our next hop
    /// otherwise. Mirrors `get_connect_details`'s direct-vs-indirect split.
    pub async fn connect_details_for(self: &Arc<Self>, target: NodeId) -> Option<(String, NodeId)> {
        if target == self.id {
            return self.mesh.my_addr().map(|addr| (addr.to_string(), self.id));
        }
        let (ask, via) = match self.mesh.route_for(target)? {
            Route::Direct => (target, self.id),
            Route::Via(next_hop) => (next_hop, next_hop),
        };
        match self.forward(ask, Message::GetConnectDetails(target)).await {
            Ok(Message::ConnectDetails { addr, .. }) => Some((addr, via)),
            _ => None,
        }
    }
}

struct NodeGraph {
    node: Arc<Node>,
}

#[async_trait]
impl RefGraph for NodeGraph {
    async fn references_of(&self, ts: TupleSpaceId) -> Vec<HolderId> {
        if ts.owning_node() == self.node.id {
            self.node.local_references(ts).unwrap_or_default()
        } else {
            match self.node.forward(ts.owning_node(), Message::GetReferences(ts)).await {
                Ok(Message::References(refs)) => refs,
                _ => Vec::new(),
            }
        }
    }

    async fn empty_tuplespace(&self, ts: TupleSpaceId) {
        if ts.owning_node() != self.node.id {
            return;
        }
        let Some(engine) = self.node.registry.get(ts) else {
            return;
        };
        let drained_all = engine.drain_all();
        // One decrement per tuple per distinct nested id, mirroring `out`'s
        // one-increment-per-tuple-per-distinct-id bookkeeping.
        let mut nested_ids = Vec::new();
        for tuple in &drained_all {
            nested_ids.extend(nested_ids_of(tuple));
        }
        for nested in nested_ids {
            let _ = self.node.decrement_ref(nested, HolderId::TupleSpace(ts)).await;
        }
        self.node.registry.remove_unreachable(ts);
    }
}

#[async_trait]
impl DeadlockGraph for NodeGraph {
    async fn references_of(&self, ts: TupleSpaceId) -> Vec<HolderId> {
        RefGraph::references_of(self, ts).await
    }

    async fn threads_of(&self, process: ProcessId) -> Vec<ThreadId> {
        if process.owning_node() == self.node.id {
            self.node.threads_of_local_process(process)
        } else {
            match self
                .node
                .forward(process.owning_node(), Message::GetThreads(process))
                .await
            {
                Ok(Message::Threads(threads)) => threads,
                _ => Vec::new(),
            }
        }
    }

    async fn blocked_threads_of(&self, ts: TupleSpaceId) -> Vec<ThreadId> {
        if ts.owning_node() == self.node.id {
            self.node
                .local_blocked_list(ts)
                .map(|list| list.into_iter().map(|b| b.thread).collect())
                .unwrap_or_default()
        } else {
            match self
                .node
                .forward(ts.owning_node(), Message::GetBlockedList(ts))
                .await
            {
                Ok(Message::BlockedList(list)) => list.into_iter().map(|b| b.thread).collect(),
                _ => Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Element;

    #[test]
    fn next_node_id_never_repeats_and_folds_in_observed_ids() {
        let node = Node::new(NodeId(1));
        assert_eq!(node.next_node_id(), NodeId(2));
        assert_eq!(node.next_node_id(), NodeId(3));
        node.observe_node_id(NodeId(10));
        assert_eq!(node.next_node_id(), NodeId(11));
        // An id lower than the running max changes nothing.
        node.observe_node_id(NodeId(4));
        assert_eq!(node.next_node_id(), NodeId(12));
    }

    #[test]
    fn register_process_and_thread_round_trip() {
        let node = Node::new(NodeId(1));
        let pid = node.register_process().unwrap();
        let tid = node.register_thread(pid).unwrap();
        assert_eq!(node.threads_of_local_process(pid), vec![tid]);
        node.unregister_thread(tid);
        assert!(node.threads_of_local_process(pid).is_empty());
    }

    #[test]
    fn references_and_blocked_list_are_empty_not_an_error_for_a_missing_ts() {
        let node = Node::new(NodeId(1));
        let ts = TupleSpaceId { node: NodeId(1), seq: 999 };
        assert_eq!(node.local_references(ts).unwrap(), Vec::new());
        assert!(node.local_blocked_list(ts).unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_details_for_self_reports_recorded_addr() {
        let node = Node::new(NodeId(1));
        assert!(node.connect_details_for(NodeId(1)).await.is_none());
        node.mesh.set_my_addr("127.0.0.1:9700".to_string());
        assert_eq!(
            node.connect_details_for(NodeId(1)).await,
            Some(("127.0.0.1:9700".to_string(), NodeId(1)))
        );
    }

    #[tokio::test]
    async fn out_increments_ref_on_a_local_nested_tuplespace() {
        let node = Node::new(NodeId(1));
        let outer = node.create_tuplespace().unwrap();
        let inner = node.create_tuplespace().unwrap();
        node.out(outer, vec![Element::TupleSpaceRef(inner)])
            .await
            .unwrap();
        assert_eq!(
            node.local_references(inner).unwrap(),
            vec![HolderId::TupleSpace(outer)]
        );
    }

    #[tokio::test]
    async fn draining_a_tuplespace_releases_its_nested_refs() {
        let node = Node::new(NodeId(1));
        let outer = node.create_tuplespace().unwrap();
        let inner = node.create_tuplespace().unwrap();
        node.out(outer, vec![Element::TupleSpaceRef(inner)])
            .await
            .unwrap();

        let graph = NodeGraph { node: node.clone() };
        graph.empty_tuplespace(outer).await;

        assert!(node.local_references(inner).unwrap().is_empty());
        assert!(!node.registry.contains(outer));
    }

    #[tokio::test]
    async fn collect_moves_a_nested_ref_from_src_to_dst() {
        use crate::value::Class;

        let node = Node::new(NodeId(1));
        let src = node.create_tuplespace().unwrap();
        let dst = node.create_tuplespace().unwrap();
        let inner = node.create_tuplespace().unwrap();
        node.out(src, vec![Element::TupleSpaceRef(inner)])
            .await
            .unwrap();
        assert_eq!(
            node.local_references(inner).unwrap(),
            vec![HolderId::TupleSpace(src)]
        );

        let moved = node
            .collect(src, dst, vec![Element::Formal(Class::TupleSpaceRef)], true)
            .await
            .unwrap();
        assert_eq!(moved, 1);

        assert_eq!(
            node.local_references(inner).unwrap(),
            vec![HolderId::TupleSpace(dst)]
        );
    }

    #[tokio::test]
    async fn copy_collect_adds_a_ref_on_dst_without_dropping_src_s() {
        use crate::value::Class;

        let node = Node::new(NodeId(1));
        let src = node.create_tuplespace().unwrap();
        let dst = node.create_tuplespace().unwrap();
        let inner = node.create_tuplespace().unwrap();
        node.out(src, vec![Element::TupleSpaceRef(inner)])
            .await
            .unwrap();

        node.collect(src, dst, vec![Element::Formal(Class::TupleSpaceRef)], false)
            .await
            .unwrap();

        assert_eq!(
            node.local_references(inner).unwrap(),
            vec![HolderId::TupleSpace(src), HolderId::TupleSpace(dst)]
        );
    }

    #[tokio::test]
    async fn multiple_in_registers_nested_refs_on_the_destination() {
        let node = Node::new(NodeId(1));
        let ts = node.create_tuplespace().unwrap();
        let inner = node.create_tuplespace().unwrap();
        node.multiple_in(ts, vec![vec![Element::TupleSpaceRef(inner)]])
            .await
            .unwrap();
        assert_eq!(
            node.local_references(inner).unwrap(),
            vec![HolderId::TupleSpace(ts)]
        );
    }
}
