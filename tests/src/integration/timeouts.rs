//! # Transaction Timeouts
//!
//! A subordinate whose superior never sends an order gives up when the
//! transaction expires; the caller sees exactly one timeout. Outcomes that
//! arrive after the timeout, and ticks that arrive after the outcome, change
//! nothing.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shared_bus::{BusEvent, EventPublisher};
    use shared_types::{UidGenerator, Xid};
    use xa_coordinator::{
        CoordinatorConfig, CoordinatorError, EventBus, EventKind, LoopbackNetwork, PeerEndpoint,
        TransactionError, TransactionManagerApi, TxEvent, XaPlusResource, XaVerb,
    };

    use crate::integration::fixtures::*;

    #[tokio::test]
    async fn test_orphaned_subordinate_times_out_once() {
        let network = LoopbackNetwork::new();
        let mut config = CoordinatorConfig::for_testing("node-b");
        config.transaction_timeout = Duration::from_millis(200);
        let b = Node::start_with(&network, config, &["db3"]).await;
        let tm = b.tm();
        let mut timed_out = b.watch(vec![EventKind::TransactionTimedOut]);

        // superior node-a exists only in the identifier
        let remote = UidGenerator::new("node-a").unwrap();
        let branch = Xid::new(remote.generate(), remote.generate_for("node-b").unwrap());
        tm.join(&branch).await.unwrap();
        tm.enlist(&branch, "db3").await.unwrap();

        let futures = tm.commit(&[branch.clone()]).await.unwrap();
        assert_eq!(single(futures).await, Err(TransactionError::Timeout));

        match next(&mut timed_out).await {
            TxEvent::TransactionTimedOut { transaction } => {
                assert_eq!(transaction.xid(), &branch);
                assert!(transaction.is_closed());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(stays_quiet(&mut timed_out).await);
        assert!(b.journal.writes().is_empty());
    }

    #[tokio::test]
    async fn test_late_order_after_timeout_is_harmless() {
        let network = LoopbackNetwork::new();
        let mut config = CoordinatorConfig::for_testing("node-b");
        config.transaction_timeout = Duration::from_millis(200);
        let b = Node::start_with(&network, config, &["db3"]).await;
        let tm = b.tm();
        let mut terminal = b.watch(EventKind::TERMINAL.to_vec());

        let remote = UidGenerator::new("node-a").unwrap();
        let branch = Xid::new(remote.generate(), remote.generate_for("node-b").unwrap());
        tm.join(&branch).await.unwrap();
        tm.enlist(&branch, "db3").await.unwrap();
        let futures = tm.commit(&[branch.clone()]).await.unwrap();
        assert_eq!(single(futures).await, Err(TransactionError::Timeout));
        assert_eq!(next(&mut terminal).await.kind(), EventKind::TransactionTimedOut);

        // the superior wakes up and orders a prepare; nothing is delivered twice
        b.coordinator.endpoint().prepare(&branch, "node-a").await.unwrap();
        assert!(stays_quiet(&mut terminal).await);
    }

    #[tokio::test]
    async fn test_late_ready_after_superior_timeout_is_ignored() {
        let network = LoopbackNetwork::new();
        let mut config = CoordinatorConfig::for_testing("node-a");
        config.transaction_timeout = Duration::from_millis(200);
        let a = Node::start_with(&network, config, &["db1"]).await;
        // node-b accepts orders but never answers
        network.register(
            "node-b",
            Arc::new(PeerEndpoint::new("node-b", Arc::new(EventBus::new()))),
        );
        let tm = a.tm();
        let mut terminal = a.watch(EventKind::TERMINAL.to_vec());

        let xid = tm.begin().await.unwrap();
        tm.enlist(&xid, "db1").await.unwrap();
        let peer = tm.create_peer_branch(&xid, "node-b").await.unwrap();
        let futures = tm.commit(&[xid.clone()]).await.unwrap();

        assert_eq!(single(futures).await, Err(TransactionError::Timeout));
        assert_eq!(next(&mut terminal).await.kind(), EventKind::TransactionTimedOut);

        // node-b finally votes, after the deadline
        a.coordinator.endpoint().ready(&peer).await.unwrap();
        assert!(stays_quiet(&mut terminal).await);
        assert!(a.journal.decisions().is_empty());
        assert_eq!(a.resource("db1").count(XaVerb::Commit), 0);
    }

    #[tokio::test]
    async fn test_tick_after_outcome_does_not_time_out() {
        let network = LoopbackNetwork::new();
        let a = Node::start(&network, "node-a", &["db1"]).await;
        let tm = a.tm();
        let mut terminal = a.watch(EventKind::TERMINAL.to_vec());

        let xid = tm.begin().await.unwrap();
        tm.enlist(&xid, "db1").await.unwrap();
        let futures = tm.commit(&[xid]).await.unwrap();
        assert_eq!(single(futures).await, Ok(true));
        assert_eq!(next(&mut terminal).await.kind(), EventKind::TwoPcDone);

        // a tick far past every deadline lands right behind the outcome
        a.coordinator
            .bus()
            .publish(TxEvent::TimerTick { now: u64::MAX })
            .await;
        assert!(stays_quiet(&mut terminal).await);
    }

    #[tokio::test]
    async fn test_abandoned_transaction_is_dropped() {
        let network = LoopbackNetwork::new();
        let mut config = CoordinatorConfig::for_testing("node-a");
        config.transaction_timeout = Duration::from_millis(200);
        let a = Node::start_with(&network, config, &["db1"]).await;
        let tm = a.tm();
        let mut timed_out = a.watch(vec![EventKind::TransactionTimedOut]);

        // begun, never committed or rolled back
        let xid = tm.begin().await.unwrap();
        tm.enlist(&xid, "db1").await.unwrap();

        match next(&mut timed_out).await {
            TxEvent::TransactionTimedOut { transaction } => {
                assert_eq!(transaction.xid(), &xid);
                assert!(transaction.is_closed());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tm.active_count(), 0);
        assert!(matches!(
            tm.commit(&[xid]).await,
            Err(CoordinatorError::UnknownTransaction(_))
        ));
        assert!(stays_quiet(&mut timed_out).await);
    }
}
