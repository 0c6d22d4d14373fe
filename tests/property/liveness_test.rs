// tests/property/liveness_test.rs

//! Serializer liveness: for any run in which the event queue receives N
//! events and outstanding I/O eventually drains, every event reaches
//! phase B, in delivery order.

use crate::harness::{TestPeers, form_cluster_with};
use flockd::core::cluster::epoch_log::EpochLog;
use flockd::core::cluster::local::LocalNet;
use flockd::core::cluster::node::{self, Node};
use proptest::prelude::*;

/// N departures in an arbitrary order, with the surviving node's I/O
/// gate released at an arbitrary point mid-run (and again at the end).
fn arb_run() -> impl Strategy<Value = (Vec<usize>, usize)> {
    (2usize..5).prop_flat_map(|n| {
        (
            Just((0..n).collect::<Vec<usize>>()).prop_shuffle(),
            0..=n,
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 12,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_all_queued_events_reach_phase_b_in_input_order((order, split) in arb_run()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let n = order.len();
            let net = LocalNet::new();
            let peers = TestPeers::new();
            let root = tempfile::tempdir().unwrap();

            // One copy so zone loss never halts; every departure commits
            // an epoch, which is what makes application order observable.
            let zones: Vec<u32> = (0..=n as u32).collect();
            let cluster = form_cluster_with(&net, &peers, root.path(), &zones, 1, 0).await;
            let survivor = &cluster[0];
            let initial = survivor.published.admission().nodes.clone();

            // While the gate is held, departures pile up on the queue.
            let mut guard = Some(survivor.gate.enter());
            for (sequenced, &victim) in order.iter().enumerate() {
                if sequenced == split {
                    // I/O drains mid-run; exactly the queued prefix applies.
                    drop(guard.take());
                    survivor.wait_epoch(1 + split as u32).await;
                    guard = Some(survivor.gate.enter());
                }
                cluster[1 + victim].crash(&net);
            }
            drop(guard.take());
            survivor.wait_epoch(1 + n as u32).await;

            // Phase B ran once per event, in delivery order: the entry
            // committed at each epoch excludes exactly the departures
            // sequenced so far.
            let log = EpochLog::open(&survivor.dir).unwrap();
            let mut expected: Vec<Node> = initial;
            for (i, &victim) in order.iter().enumerate() {
                expected = node::without_node(&expected, &cluster[1 + victim].node.id);
                assert_eq!(log.read(2 + i as u32), expected);
            }
        });
    }
}
