//! # Two-Phase Commit Across Coordinators
//!
//! `node-a` is superior with two local resources; `node-b` is subordinate
//! with one resource of its own, reached as an XA+ branch.
//!
//! ```text
//! node-a ──prepare──→ node-b ──ready──→ node-a
//! node-a ──commit───→ node-b ──done───→ node-a
//! ```

#[cfg(test)]
mod tests {
    use shared_types::{Decision, XaException, XA_RBROLLBACK};
    use xa_coordinator::{
        EventKind, LoopbackNetwork, PeerVerb, TransactionManagerApi, TxEvent, XaVerb,
    };

    use crate::integration::fixtures::*;

    async fn pair(network: &LoopbackNetwork) -> (Node, Node) {
        let superior = Node::start(network, "node-a", &["db1", "db2"]).await;
        let subordinate = Node::start(network, "node-b", &["db3"]).await;
        (superior, subordinate)
    }

    #[tokio::test]
    async fn test_xa_and_xaplus_branches_commit() {
        let network = LoopbackNetwork::new();
        let (a, b) = pair(&network).await;
        let (tm_a, tm_b) = (a.tm(), b.tm());

        let xid = tm_a.begin().await.unwrap();
        tm_a.enlist(&xid, "db1").await.unwrap();
        tm_a.enlist(&xid, "db2").await.unwrap();
        let branch = tm_a.create_peer_branch(&xid, "node-b").await.unwrap();

        tm_b.join(&branch).await.unwrap();
        tm_b.enlist(&branch, "db3").await.unwrap();

        let sub_futures = tm_b.commit(&[branch.clone()]).await.unwrap();
        let sup_futures = tm_a.commit(&[xid.clone()]).await.unwrap();

        assert_eq!(single(sup_futures).await, Ok(true));
        assert_eq!(single(sub_futures).await, Ok(true));

        for name in ["db1", "db2"] {
            let db = a.resource(name);
            assert_eq!(db.count(XaVerb::Prepare), 1);
            assert_eq!(db.count(XaVerb::Commit), 1);
            assert!(db.in_doubt().is_empty());
        }
        assert_eq!(b.resource("db3").count(XaVerb::Commit), 1);

        // one decision and one completion on the superior, covering all branches
        let decisions = a.journal.decisions();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision, Decision::Commit);
        assert_eq!(decisions[0].records.len(), 3);
        assert_eq!(a.journal.completions().len(), 1);
        assert_eq!(b.journal.decisions().len(), 1);
        assert_eq!(b.journal.completions().len(), 1);

        assert_eq!(network.calls_to("node-b", PeerVerb::Prepare).len(), 1);
        assert_eq!(network.calls_to("node-b", PeerVerb::Commit).len(), 1);
        assert_eq!(network.calls_to("node-a", PeerVerb::Ready).len(), 1);
        assert_eq!(network.calls_to("node-a", PeerVerb::Done).len(), 1);
        assert!(network.calls_to("node-b", PeerVerb::Rollback).is_empty());
    }

    #[tokio::test]
    async fn test_subordinate_prepare_failure_rolls_back_everywhere() {
        let network = LoopbackNetwork::new();
        let (a, b) = pair(&network).await;
        let (tm_a, tm_b) = (a.tm(), b.tm());
        b.resource("db3")
            .fail_on(XaVerb::Prepare, XaException::new(XA_RBROLLBACK, "constraint"));

        let xid = tm_a.begin().await.unwrap();
        tm_a.enlist(&xid, "db1").await.unwrap();
        tm_a.enlist(&xid, "db2").await.unwrap();
        let branch = tm_a.create_peer_branch(&xid, "node-b").await.unwrap();
        tm_b.join(&branch).await.unwrap();
        tm_b.enlist(&branch, "db3").await.unwrap();

        let sub_futures = tm_b.commit(&[branch]).await.unwrap();
        let sup_futures = tm_a.commit(&[xid]).await.unwrap();

        assert_eq!(single(sup_futures).await, Ok(false));
        assert_eq!(single(sub_futures).await, Ok(false));

        for name in ["db1", "db2"] {
            let db = a.resource(name);
            assert_eq!(db.count(XaVerb::Rollback), 1);
            assert_eq!(db.count(XaVerb::Commit), 0);
        }
        assert_eq!(network.calls_to("node-a", PeerVerb::Failed).len(), 1);
        assert_eq!(network.calls_to("node-b", PeerVerb::Rollback).len(), 1);
        assert!(network.calls_to("node-b", PeerVerb::Commit).is_empty());
        assert_eq!(a.journal.decisions()[0].decision, Decision::Rollback);
    }

    #[tokio::test]
    async fn test_rollback_order_preempts_local_commit() {
        let network = LoopbackNetwork::new();
        let (a, b) = pair(&network).await;
        let (tm_a, tm_b) = (a.tm(), b.tm());

        let xid = tm_a.begin().await.unwrap();
        tm_a.enlist(&xid, "db1").await.unwrap();
        let branch = tm_a.create_peer_branch(&xid, "node-b").await.unwrap();
        tm_b.join(&branch).await.unwrap();
        tm_b.enlist(&branch, "db3").await.unwrap();

        let sup_futures = tm_a.rollback(&[xid]).await.unwrap();
        eventually("rollback order at node-b", || {
            !network.calls_to("node-b", PeerVerb::Rollback).is_empty()
        })
        .await;

        // the user on node-b still asks to commit; the order wins
        let sub_futures = tm_b.commit(&[branch]).await.unwrap();

        assert_eq!(single(sub_futures).await, Ok(false));
        assert_eq!(single(sup_futures).await, Ok(false));

        let db3 = b.resource("db3");
        assert_eq!(db3.count(XaVerb::Prepare), 0);
        assert_eq!(db3.count(XaVerb::Rollback), 1);
        assert_eq!(a.resource("db1").count(XaVerb::Rollback), 1);
        assert!(network.calls_to("node-b", PeerVerb::Prepare).is_empty());
        assert_eq!(network.calls_to("node-a", PeerVerb::Done).len(), 1);
    }

    #[tokio::test]
    async fn test_local_only_commit_needs_no_peers() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1", "db2"]).await;
        let tm = a.tm();
        let mut done = a.watch(vec![EventKind::TwoPcDone]);

        let xid = tm.begin().await.unwrap();
        tm.enlist(&xid, "db1").await.unwrap();
        tm.enlist(&xid, "db2").await.unwrap();
        let futures = tm.commit(&[xid.clone()]).await.unwrap();

        assert_eq!(single(futures).await, Ok(true));
        match next(&mut done).await {
            TxEvent::TwoPcDone { transaction } => assert_eq!(transaction.xid(), &xid),
            other => panic!("unexpected {other:?}"),
        }
        assert!(network.calls().is_empty());
        assert!(stays_quiet(&mut done).await);
    }

    #[tokio::test]
    async fn test_read_only_branch_skips_phase_two() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1", "db2"]).await;
        a.resource("db2").vote_read_only();
        let tm = a.tm();

        let xid = tm.begin().await.unwrap();
        tm.enlist(&xid, "db1").await.unwrap();
        tm.enlist(&xid, "db2").await.unwrap();

        assert_eq!(single(tm.commit(&[xid]).await.unwrap()).await, Ok(true));
        assert_eq!(a.resource("db1").count(XaVerb::Commit), 1);
        assert_eq!(a.resource("db2").count(XaVerb::Commit), 0);
    }

    #[tokio::test]
    async fn test_batch_commit_returns_one_future_each() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1"]).await;
        let tm = a.tm();

        let first = tm.begin().await.unwrap();
        let second = tm.begin().await.unwrap();
        tm.enlist(&first, "db1").await.unwrap();
        tm.enlist(&second, "db1").await.unwrap();

        let futures = tm.commit(&[first.clone(), second.clone()]).await.unwrap();
        assert_eq!(futures[0].xid(), &first);
        assert_eq!(futures[1].xid(), &second);
        for future in futures {
            assert_eq!(outcome(future).await, Ok(true));
        }
        assert_eq!(a.resource("db1").count(XaVerb::Commit), 2);
        assert_eq!(a.journal.decisions().len(), 2);
    }
}
