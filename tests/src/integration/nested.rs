//! # Nested Subordinates
//!
//! `node-a` begins the transaction, `node-b` joins it and hands part of the
//! work on to `node-c`. Every xid still names `node-a` as the gtrid owner,
//! but `node-c` answers the server that ordered it.
//!
//! ```text
//! node-a ──prepare──→ node-b ──prepare──→ node-c
//! node-a ←──ready─── node-b ←──ready─── node-c
//! ```

#[cfg(test)]
mod tests {
    use shared_types::{Decision, XaException, XA_RBROLLBACK};
    use xa_coordinator::{LoopbackNetwork, PeerVerb, TransactionManagerApi, XaVerb};

    use crate::integration::fixtures::*;

    #[tokio::test]
    async fn test_three_levels_commit_through_the_middle() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1"]).await;
        let b = Node::start(&network, "node-b", &["db3"]).await;
        let c = Node::start(&network, "node-c", &["db5"]).await;
        let (tm_a, tm_b, tm_c) = (a.tm(), b.tm(), c.tm());

        let xid = tm_a.begin().await.unwrap();
        tm_a.enlist(&xid, "db1").await.unwrap();
        let to_b = tm_a.create_peer_branch(&xid, "node-b").await.unwrap();

        tm_b.join(&to_b).await.unwrap();
        tm_b.enlist(&to_b, "db3").await.unwrap();
        let to_c = tm_b.create_peer_branch(&to_b, "node-c").await.unwrap();
        assert_eq!(to_c.superior_server_id(), "node-a");
        assert_eq!(to_c.branch_server_id(), "node-c");

        tm_c.join(&to_c).await.unwrap();
        tm_c.enlist(&to_c, "db5").await.unwrap();

        let c_futures = tm_c.commit(&[to_c.clone()]).await.unwrap();
        let b_futures = tm_b.commit(&[to_b.clone()]).await.unwrap();
        let a_futures = tm_a.commit(&[xid]).await.unwrap();

        assert_eq!(single(a_futures).await, Ok(true));
        assert_eq!(single(b_futures).await, Ok(true));
        assert_eq!(single(c_futures).await, Ok(true));

        for (node, name) in [(&a, "db1"), (&b, "db3"), (&c, "db5")] {
            let db = node.resource(name);
            assert_eq!(db.count(XaVerb::Commit), 1, "{name}");
            assert_eq!(db.count(XaVerb::Rollback), 0, "{name}");
        }

        // orders reach node-c from node-b, naming node-b
        let prepares = network.calls_to("node-c", PeerVerb::Prepare);
        assert_eq!(prepares.len(), 1);
        assert_eq!(prepares[0].named_server.as_deref(), Some("node-b"));
        let commits = network.calls_to("node-c", PeerVerb::Commit);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].named_server.as_deref(), Some("node-b"));

        // node-c reports to node-b; node-a only hears from node-b
        for verb in [PeerVerb::Ready, PeerVerb::Done] {
            let to_middle = network.calls_to("node-b", verb);
            assert_eq!(to_middle.len(), 1, "{verb:?} to node-b");
            assert_eq!(to_middle[0].xid.as_ref(), Some(&to_c));

            let to_top = network.calls_to("node-a", verb);
            assert_eq!(to_top.len(), 1, "{verb:?} to node-a");
            assert_eq!(to_top[0].xid.as_ref(), Some(&to_b));
        }
        assert!(network.calls_to("node-a", PeerVerb::Failed).is_empty());
        assert!(network.calls_to("node-b", PeerVerb::Failed).is_empty());

        // node-c remembers who to ask if it restarts in doubt
        let c_branch = c.resource("db5").xids_for(XaVerb::Prepare)[0].clone();
        assert_eq!(c.journal.superior_of(&c_branch).as_deref(), Some("node-b"));
        let b_branch = b.resource("db3").xids_for(XaVerb::Prepare)[0].clone();
        assert_eq!(b.journal.superior_of(&b_branch), None);

        for node in [&a, &b, &c] {
            let decisions = node.journal.decisions();
            assert_eq!(decisions.len(), 1);
            assert_eq!(decisions[0].decision, Decision::Commit);
        }
    }

    #[tokio::test]
    async fn test_failed_vote_climbs_one_level_at_a_time() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1"]).await;
        let b = Node::start(&network, "node-b", &["db3"]).await;
        let c = Node::start(&network, "node-c", &["db5"]).await;
        let (tm_a, tm_b, tm_c) = (a.tm(), b.tm(), c.tm());
        c.resource("db5")
            .fail_on(XaVerb::Prepare, XaException::new(XA_RBROLLBACK, "constraint"));

        let xid = tm_a.begin().await.unwrap();
        tm_a.enlist(&xid, "db1").await.unwrap();
        let to_b = tm_a.create_peer_branch(&xid, "node-b").await.unwrap();
        tm_b.join(&to_b).await.unwrap();
        tm_b.enlist(&to_b, "db3").await.unwrap();
        let to_c = tm_b.create_peer_branch(&to_b, "node-c").await.unwrap();
        tm_c.join(&to_c).await.unwrap();
        tm_c.enlist(&to_c, "db5").await.unwrap();

        let c_futures = tm_c.commit(&[to_c.clone()]).await.unwrap();
        let b_futures = tm_b.commit(&[to_b.clone()]).await.unwrap();
        let a_futures = tm_a.commit(&[xid]).await.unwrap();

        assert_eq!(single(a_futures).await, Ok(false));
        assert_eq!(single(b_futures).await, Ok(false));
        assert_eq!(single(c_futures).await, Ok(false));

        // the failed vote travels one level at a time
        let failed_to_b = network.calls_to("node-b", PeerVerb::Failed);
        assert_eq!(failed_to_b.len(), 1);
        assert_eq!(failed_to_b[0].xid.as_ref(), Some(&to_c));
        let failed_to_a = network.calls_to("node-a", PeerVerb::Failed);
        assert_eq!(failed_to_a.len(), 1);
        assert_eq!(failed_to_a[0].xid.as_ref(), Some(&to_b));

        assert_eq!(a.resource("db1").count(XaVerb::Rollback), 1);
        assert_eq!(b.resource("db3").count(XaVerb::Rollback), 1);
        assert_eq!(a.resource("db1").count(XaVerb::Commit), 0);
        assert_eq!(b.resource("db3").count(XaVerb::Commit), 0);
        assert_eq!(c.resource("db5").count(XaVerb::Commit), 0);
    }
}
