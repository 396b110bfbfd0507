//! Principled predicate under deadlock (S6): two threads of the same
//! process each `inp` on a disjoint template against a tuplespace with no
//! matching tuples, and no liveness outside the process's own threads.
//! The detector must fire and release exactly one of the two with
//! `unblock`; the other keeps blocking.

mod common;

use common::{spawn_node, Client};
use tsmesh::ids::HolderId;
use tsmesh::value::{Class, Element};
use tsmesh::wire::Message;

#[tokio::test]
async fn one_of_two_deadlocked_predicate_waiters_is_released() {
    let node = spawn_node(31).await;

    let mut setup = Client::connect(node.addr).await;
    let ts = match setup.request(&Message::CreateTupleSpace).await {
        Message::TupleSpaceCreated(ts) => ts,
        other => panic!("unexpected reply: {other:?}"),
    };
    let pid = match setup.request(&Message::RegisterProcess).await {
        Message::ProcessRegistered(p) => p,
        other => panic!("unexpected reply: {other:?}"),
    };
    // Anchor the process as a holder of `ts` so the deadlock walk finds it
    // (and, finding no other root, both of its threads).
    assert!(matches!(
        setup
            .request(&Message::IncrementRef {
                ts,
                holder: HolderId::Process(pid),
            })
            .await,
        Message::Done
    ));

    let tid_a = match setup.request(&Message::RegisterThread(pid)).await {
        Message::ThreadRegistered(t) => t,
        other => panic!("unexpected reply: {other:?}"),
    };
    let tid_b = match setup.request(&Message::RegisterThread(pid)).await {
        Message::ThreadRegistered(t) => t,
        other => panic!("unexpected reply: {other:?}"),
    };

    let mut client_a = Client::connect(node.addr).await;
    let mut client_b = Client::connect(node.addr).await;

    // Both requests are sent on persistent connections and only resolve
    // once the server replies (either with a match, or later with
    // `unblock`), so fire each and wait for its single reply directly.
    let req_a = client_a.request(&Message::InTuple {
        ts,
        template: vec![Element::Formal(Class::Int)],
        thread: tid_a,
        unblockable: true,
    });
    let req_b = client_b.request(&Message::InTuple {
        ts,
        template: vec![Element::Formal(Class::Str)],
        thread: tid_b,
        unblockable: true,
    });
    tokio::pin!(req_a);
    tokio::pin!(req_b);

    // The detector releases exactly one waiter; the other stays blocked
    // indefinitely (per the spec, it only resolves on its own next scan),
    // so only the first to complete is meaningful here.
    let first = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        tokio::select! {
            reply = &mut req_a => reply,
            reply = &mut req_b => reply,
        }
    })
    .await
    .expect("deadlock detector should have released one waiter");

    assert!(
        matches!(first, Message::Unblock),
        "the released predicate waiter should get an unblock sentinel, got {first:?}"
    );
}
