//! # Recovery
//!
//! Resources come back with prepared branches nobody finished. A fresh
//! coordinator resolves them from its journal:
//!
//! | Journal | Superior | Outcome |
//! |---------|----------|---------|
//! | decision logged | any | apply it |
//! | nothing | this node | rollback |
//! | nothing | remote | one `retry` to that superior, then wait for orders |

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use shared_types::Decision;
    use xa_coordinator::{
        BranchRecord, EventBus, EventKind, LoopbackNetwork, PeerEndpoint, PeerVerb,
        TransactionManagerApi, TxEvent, XaPlusResource, XaVerb,
    };

    use crate::integration::fixtures::*;

    async fn finished_round(node: &Node) -> bool {
        let mut finished = node.watch(vec![EventKind::RecoveryFinished]);
        node.coordinator.recover().await;
        match next(&mut finished).await {
            TxEvent::RecoveryFinished { succeeded, .. } => succeeded,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unlogged_local_branch_is_rolled_back() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1"]).await;
        let db = a.resource("db1");
        let orphan = aged_xid("node-a", "node-a", 1);
        db.add_in_doubt(orphan.clone());

        assert!(finished_round(&a).await);
        eventually("presumed rollback", || db.in_doubt().is_empty()).await;
        assert_eq!(db.xids_for(XaVerb::Rollback), vec![orphan]);
        assert_eq!(db.count(XaVerb::Commit), 0);
    }

    #[tokio::test]
    async fn test_logged_commit_is_replayed_and_closed() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1"]).await;
        let db = a.resource("db1");
        let branch = aged_xid("node-a", "node-a", 2);
        db.add_in_doubt(branch.clone());
        a.journal.seed_decision(
            vec![BranchRecord::new(branch.clone(), "db1")],
            Decision::Commit,
            1,
        );

        let mut committed = a.watch(vec![EventKind::RecoveredXidCommitted]);
        assert!(finished_round(&a).await);
        match next(&mut committed).await {
            TxEvent::RecoveredXidCommitted { xid, resource_name } => {
                assert_eq!(xid, branch);
                assert_eq!(resource_name, "db1");
            }
            other => panic!("unexpected {other:?}"),
        }
        eventually("completion logged", || !a.journal.completions().is_empty()).await;
        assert_eq!(a.journal.completions()[0].decision, Decision::Commit);
    }

    #[tokio::test]
    async fn test_remote_superior_gets_one_retry() {
        let network = LoopbackNetwork::new();
        let _superior = Node::start(&network, "node-a", &[]).await;
        let b = Node::start(&network, "node-b", &["db3", "db4"]).await;
        let first = aged_xid("node-a", "node-b", 1);
        let second = aged_xid("node-a", "node-b", 2);
        b.resource("db3").add_in_doubt(first.clone());
        b.resource("db4").add_in_doubt(second.clone());

        assert!(finished_round(&b).await);
        eventually("retry sent", || {
            !network.calls_to("node-a", PeerVerb::Retry).is_empty()
        })
        .await;

        let retries = network.calls_to("node-a", PeerVerb::Retry);
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].named_server.as_deref(), Some("node-b"));
        // nothing is presumed for a remote superior
        assert_eq!(b.resource("db3").count(XaVerb::Rollback), 0);
        assert_eq!(b.resource("db4").count(XaVerb::Rollback), 0);

        // the superior answers with its decision for the first branch
        b.coordinator.endpoint().commit(&first, "node-a").await.unwrap();
        let db3 = b.resource("db3");
        eventually("redelivered commit applied", || db3.in_doubt().is_empty()).await;
        assert_eq!(db3.xids_for(XaVerb::Commit), vec![first.clone()]);
        eventually("done reported", || {
            !network.calls_to("node-a", PeerVerb::Done).is_empty()
        })
        .await;
        assert_eq!(
            network.calls_to("node-a", PeerVerb::Done)[0].xid.as_ref(),
            Some(&first)
        );
        assert_eq!(b.resource("db4").in_doubt(), vec![second]);
    }

    #[tokio::test]
    async fn test_second_round_finds_nothing_to_do() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1", "db2"]).await;
        a.resource("db1").add_in_doubt(aged_xid("node-a", "node-a", 1));
        a.resource("db2").add_in_doubt(aged_xid("node-a", "node-a", 2));

        assert!(finished_round(&a).await);
        eventually("first round resolved", || {
            a.resource("db1").in_doubt().is_empty() && a.resource("db2").in_doubt().is_empty()
        })
        .await;

        assert!(finished_round(&a).await);
        assert_eq!(a.resource("db1").count(XaVerb::Rollback), 1);
        assert_eq!(a.resource("db2").count(XaVerb::Rollback), 1);
        assert!(a.journal.writes().is_empty());
    }

    #[tokio::test]
    async fn test_branches_of_inflight_transactions_are_left_alone() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1"]).await;
        // node-b accepts orders but never answers, so the commit stays in flight
        network.register(
            "node-b",
            Arc::new(PeerEndpoint::new("node-b", Arc::new(EventBus::new()))),
        );
        let tm = a.tm();

        let xid = tm.begin().await.unwrap();
        tm.enlist(&xid, "db1").await.unwrap();
        tm.create_peer_branch(&xid, "node-b").await.unwrap();
        let _pending = tm.commit(&[xid]).await.unwrap();
        let db = a.resource("db1");
        eventually("db1 prepared", || !db.in_doubt().is_empty()).await;
        let prepared = db.in_doubt();

        assert!(finished_round(&a).await);
        assert_eq!(db.count(XaVerb::Rollback), 0);
        assert_eq!(db.in_doubt(), prepared);
    }
}
