//! A brand-new node joining an existing mesh via `--connect`: its id must
//! be freshly minted (not collide with the founder or an earlier joiner),
//! and the accept side must recognize the join handshake's different frame
//! order rather than mistake it for the ordinary peer handshake.

mod common;

use common::{join, spawn_node, Client};
use tsmesh::wire::Message;

#[tokio::test]
async fn joiners_get_distinct_ids_not_the_founder_s() {
    let founder = spawn_node(1).await;
    let joiner_a = join(&founder).await;
    let joiner_b = join(&founder).await;

    assert_ne!(joiner_a.node.id, founder.node.id);
    assert_ne!(joiner_b.node.id, founder.node.id);
    assert_ne!(joiner_a.node.id, joiner_b.node.id);
}

#[tokio::test]
async fn founder_reports_a_joiner_as_a_neighbour() {
    let founder = spawn_node(2).await;
    let joiner = join(&founder).await;

    let mut client = Client::connect(founder.addr).await;
    let neighbours = match client.request(&Message::GetNeighbours).await {
        Message::Neighbours(n) => n,
        other => panic!("unexpected reply: {other:?}"),
    };
    assert!(neighbours.iter().any(|(id, _)| *id == joiner.node.id));
}
