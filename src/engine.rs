//! Tuplespace engine (component B): one per hosted tuplespace.
//!
//! A single `parking_lot::Mutex` serializes container mutation; `refs` and
//! `blocked` get their own locks so introspection (component H's GC/deadlock
//! walk) never has to take the container lock. Blocking `rd`/`in` never wait
//! while holding a lock: a miss registers a waiter and hands the caller a
//! oneshot receiver to await outside the engine entirely, matching the
//! "blocking-without-lock" discipline the original's thread-per-connection
//! model relied on.

use crate::container::Trie;
use crate::error::{Result, TsMeshError};
use crate::ids::{HolderId, ThreadId, TupleSpaceId};
use crate::value::{tuple_matches, Template, Tuple};
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// What a released blocked waiter receives.
#[derive(Debug, Clone)]
pub enum WaiterOutcome {
    /// A matching tuple was delivered.
    Delivered(Tuple),
    /// Released by deadlock recovery; callers must treat this as "no match",
    /// never as an error.
    Unblocked,
}

struct Waiter {
    template: Template,
    unblockable: bool,
    destructive: bool,
    notify: oneshot::Sender<WaiterOutcome>,
}

/// Result of a blocking primitive: either an immediate match, or a receiver
/// the caller awaits once it has registered with the deadlock detector.
pub enum MatchOrWait {
    Matched(Tuple),
    Waiting(oneshot::Receiver<WaiterOutcome>),
}

/// A snapshot of one blocked waiter for the deadlock walk (component H).
#[derive(Debug, Clone, Copy)]
pub struct BlockedEntry {
    pub thread: ThreadId,
    pub unblockable: bool,
    pub destructive: bool,
}

pub struct Engine {
    id: TupleSpaceId,
    container: parking_lot::Mutex<Trie>,
    blocked: parking_lot::RwLock<HashMap<ThreadId, Waiter>>,
    refs: parking_lot::RwLock<Vec<HolderId>>,
    kill_lock: parking_lot::Mutex<()>,
}

impl Engine {
    pub fn new(id: TupleSpaceId) -> Self {
        Engine {
            id,
            container: parking_lot::Mutex::new(Trie::new()),
            blocked: parking_lot::RwLock::new(HashMap::new()),
            refs: parking_lot::RwLock::new(Vec::new()),
            kill_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn id(&self) -> TupleSpaceId {
        self.id
    }

    /// Deposits `tuple`. Blocked waiters whose template matches are served
    /// from the snapshot first; the first *destructive* (`in`) match
    /// consumes the tuple and stops the scan (at most one destructive match
    /// per `out`), while non-destructive (`rd`) matches may be served
    /// alongside it. If no destructive match occurred, the tuple is added to
    /// the container.
    pub fn out(&self, tuple: Tuple) {
        let mut fulfilled_destructive = false;
        let mut delivered = Vec::new();
        {
            let mut blocked = self.blocked.write();
            let candidates: Vec<ThreadId> = blocked.keys().copied().collect();
            for tid in candidates {
                if fulfilled_destructive {
                    break;
                }
                let is_match = blocked
                    .get(&tid)
                    .map(|w| tuple_matches(&w.template, &tuple))
                    .unwrap_or(false);
                if !is_match {
                    continue;
                }
                let waiter = blocked.remove(&tid).expect("just matched");
                if waiter.destructive {
                    fulfilled_destructive = true;
                }
                delivered.push((tid, waiter));
            }
        }

        for (tid, waiter) in delivered {
            self.add_reference(HolderId::Process(tid.process_id()));
            debug!(ts = %self.id, thread = %tid, "out: delivered to blocked waiter");
            let _ = waiter.notify.send(WaiterOutcome::Delivered(tuple.clone()));
        }

        if !fulfilled_destructive {
            self.container.lock().add(&tuple);
            debug!(ts = %self.id, "out: tuple stored");
        }
    }

    pub fn rd(&self, thread: ThreadId, template: Template, unblockable: bool) -> MatchOrWait {
        self.read_or_take(thread, template, unblockable, false)
    }

    pub fn in_(&self, thread: ThreadId, template: Template, unblockable: bool) -> MatchOrWait {
        self.read_or_take(thread, template, unblockable, true)
    }

    fn read_or_take(
        &self,
        thread: ThreadId,
        template: Template,
        unblockable: bool,
        destructive: bool,
    ) -> MatchOrWait {
        let mut container = self.container.lock();
        if let Some(tuple) = container.match_one(&template) {
            if destructive {
                container.delete(&tuple);
            }
            drop(container);
            self.add_reference(HolderId::Process(thread.process_id()));
            return MatchOrWait::Matched(tuple);
        }
        drop(container);

        let (tx, rx) = oneshot::channel();
        self.blocked.write().insert(
            thread,
            Waiter {
                template,
                unblockable,
                destructive,
                notify: tx,
            },
        );
        debug!(ts = %self.id, thread = %thread, destructive, "blocked: no immediate match");
        MatchOrWait::Waiting(rx)
    }

    /// Principled predicate read: `rdp`. Registers exactly like `rd`, always
    /// `unblockable`, so a later deadlock scan may release it with
    /// `WaiterOutcome::Unblocked` instead of a tuple; it is not
    /// instantaneous, only guaranteed to eventually resolve without a true
    /// deadlock ever wedging it.
    pub fn rdp(&self, thread: ThreadId, template: Template) -> MatchOrWait {
        self.read_or_take(thread, template, true, false)
    }

    /// Principled predicate take: `inp`. See [`Engine::rdp`].
    pub fn inp(&self, thread: ThreadId, template: Template) -> MatchOrWait {
        self.read_or_take(thread, template, true, true)
    }

    /// Drains every tuple matching `template` (used to move tuples into
    /// another tuplespace).
    pub fn collect(&self, template: &Template) -> Vec<Tuple> {
        let mut container = self.container.lock();
        let matches = container.match_all(template);
        for m in &matches {
            container.delete(m);
        }
        matches
    }

    /// Copies every tuple matching `template` without removing them.
    pub fn copy_collect(&self, template: &Template) -> Vec<Tuple> {
        self.container.lock().match_all(template)
    }

    /// Removes every tuple regardless of arity, for GC's `empty_tuplespace`
    /// (which has no single fixed-arity template to drive `collect` with).
    pub fn drain_all(&self) -> Vec<Tuple> {
        let mut container = self.container.lock();
        let tuples = container.enumerate_all();
        *container = Trie::new();
        tuples
    }

    /// Drops a specific thread's waiter without delivering anything, e.g.
    /// when its owning connection disconnects mid-wait. The waiter's oneshot
    /// sender is dropped along with it, so an in-flight awaiter sees
    /// `RecvError` rather than hanging forever.
    pub fn remove_waiter(&self, thread: ThreadId) -> bool {
        self.blocked.write().remove(&thread).is_some()
    }

    pub fn tuple_count(&self) -> usize {
        self.container.lock().len()
    }

    pub fn is_container_empty(&self) -> bool {
        self.container.lock().is_empty()
    }

    pub fn add_reference(&self, holder: HolderId) {
        if self.id.is_universal() {
            return;
        }
        self.refs.write().push(holder);
    }

    /// Removes one occurrence of `holder` and returns the remaining
    /// reference count, mirroring `removereference`'s return value, which
    /// the registry uses to decide whether to delete the tuplespace.
    pub fn remove_reference(&self, holder: HolderId) -> Result<usize> {
        if self.id.is_universal() {
            return Ok(usize::MAX);
        }
        let _kill = self.kill_lock.lock();
        let mut refs = self.refs.write();
        match refs.iter().position(|h| *h == holder) {
            Some(pos) => {
                refs.remove(pos);
                Ok(refs.len())
            }
            None => Err(TsMeshError::ReferenceInconsistency {
                id: self.id.to_string(),
            }),
        }
    }

    /// Removes every occurrence of `holder` (process/node death cleanup).
    pub fn remove_all_references(&self, holder: HolderId) {
        if self.id.is_universal() {
            return;
        }
        let _kill = self.kill_lock.lock();
        self.refs.write().retain(|h| *h != holder);
    }

    pub fn refs_snapshot(&self) -> Vec<HolderId> {
        self.refs.read().clone()
    }

    pub fn blocked_snapshot(&self) -> Vec<BlockedEntry> {
        self.blocked
            .read()
            .iter()
            .map(|(tid, w)| BlockedEntry {
                thread: *tid,
                unblockable: w.unblockable,
                destructive: w.destructive,
            })
            .collect()
    }

    /// Releases one arbitrary `unblockable` waiter to break a detected
    /// deadlock. The released caller sees `WaiterOutcome::Unblocked`, which
    /// must be treated as "no match", never as an error.
    pub fn unblock_random(&self) -> bool {
        let mut blocked = self.blocked.write();
        let mut rng = rand::thread_rng();
        let candidate = blocked
            .iter()
            .filter(|(_, w)| w.unblockable)
            .map(|(tid, _)| *tid)
            .choose(&mut rng);
        match candidate {
            Some(tid) => {
                let waiter = blocked.remove(&tid).expect("just chosen");
                drop(blocked);
                debug!(ts = %self.id, thread = %tid, "unblockRandom: releasing waiter");
                let _ = waiter.notify.send(WaiterOutcome::Unblocked);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Class, Element};

    fn tid(n: u64) -> ThreadId {
        ThreadId {
            node: crate::ids::NodeId(n),
            seq: 1,
            tseq: 1,
        }
    }

    fn ts(n: u64, seq: u64) -> TupleSpaceId {
        TupleSpaceId {
            node: crate::ids::NodeId(n),
            seq,
        }
    }

    #[test]
    fn out_then_rd_matches_without_removing() {
        let engine = Engine::new(ts(1, 1));
        engine.out(vec![Element::Int(5)]);
        let result = engine.rd(tid(1), vec![Element::Formal(Class::Int)], false);
        match result {
            MatchOrWait::Matched(t) => assert_eq!(t, vec![Element::Int(5)]),
            MatchOrWait::Waiting(_) => panic!("expected immediate match"),
        }
        assert_eq!(engine.tuple_count(), 1);
    }

    #[test]
    fn out_then_in_removes_tuple() {
        let engine = Engine::new(ts(1, 1));
        engine.out(vec![Element::Int(5)]);
        let result = engine.in_(tid(1), vec![Element::Formal(Class::Int)], false);
        assert!(matches!(result, MatchOrWait::Matched(_)));
        assert_eq!(engine.tuple_count(), 0);
    }

    #[tokio::test]
    async fn blocked_in_is_woken_by_out() {
        let engine = Engine::new(ts(1, 1));
        let rx = match engine.in_(tid(1), vec![Element::Formal(Class::Int)], true) {
            MatchOrWait::Waiting(rx) => rx,
            MatchOrWait::Matched(_) => panic!("expected block"),
        };
        engine.out(vec![Element::Int(9)]);
        let outcome = rx.await.unwrap();
        match outcome {
            WaiterOutcome::Delivered(t) => assert_eq!(t, vec![Element::Int(9)]),
            WaiterOutcome::Unblocked => panic!("expected delivery"),
        }
        // destructive match means the tuple never landed in the container
        assert_eq!(engine.tuple_count(), 0);
    }

    #[test]
    fn at_most_one_destructive_match_per_out() {
        let engine = Engine::new(ts(1, 1));
        let rx_in = match engine.in_(tid(1), vec![Element::Formal(Class::Int)], false) {
            MatchOrWait::Waiting(rx) => rx,
            _ => panic!(),
        };
        let rx_in2 = match engine.in_(tid(2), vec![Element::Formal(Class::Int)], false) {
            MatchOrWait::Waiting(rx) => rx,
            _ => panic!(),
        };
        engine.out(vec![Element::Int(1)]);
        assert!(rx_in.try_recv().is_ok() ^ rx_in2.try_recv().is_ok());
        assert_eq!(engine.tuple_count(), 0);
    }

    #[tokio::test]
    async fn unblock_random_releases_unblockable_waiter() {
        let engine = Engine::new(ts(1, 1));
        let rx = match engine.rd(tid(1), vec![Element::Formal(Class::Int)], true) {
            MatchOrWait::Waiting(rx) => rx,
            _ => panic!(),
        };
        assert!(engine.unblock_random());
        assert!(matches!(rx.await.unwrap(), WaiterOutcome::Unblocked));
    }

    #[test]
    fn reference_count_tracks_add_remove() {
        let engine = Engine::new(ts(1, 1));
        let holder = HolderId::Node(crate::ids::NodeId(2));
        engine.add_reference(holder);
        engine.add_reference(holder);
        assert_eq!(engine.remove_reference(holder).unwrap(), 1);
        assert_eq!(engine.remove_reference(holder).unwrap(), 0);
        assert!(engine.remove_reference(holder).is_err());
    }

    #[test]
    fn drain_all_empties_the_container_regardless_of_arity() {
        let engine = Engine::new(ts(1, 1));
        engine.out(vec![Element::Int(1)]);
        engine.out(vec![Element::Int(2), Element::Str("a".into())]);
        engine.out(Vec::new());
        let drained = engine.drain_all();
        assert_eq!(drained.len(), 3);
        assert!(engine.is_container_empty());
    }

    #[tokio::test]
    async fn remove_waiter_drops_it_without_delivering() {
        let engine = Engine::new(ts(1, 1));
        let rx = match engine.rd(tid(1), vec![Element::Formal(Class::Int)], false) {
            MatchOrWait::Waiting(rx) => rx,
            _ => panic!(),
        };
        assert!(engine.remove_waiter(tid(1)));
        assert!(rx.await.is_err());
        assert!(!engine.remove_waiter(tid(1)));
    }

    #[test]
    fn universal_tuplespace_refs_are_a_no_op() {
        let engine = Engine::new(TupleSpaceId::UNIVERSAL);
        let holder = HolderId::Node(crate::ids::NodeId(2));
        engine.add_reference(holder);
        assert_eq!(engine.refs_snapshot().len(), 0);
        assert_eq!(engine.remove_reference(holder).unwrap(), usize::MAX);
    }
}
