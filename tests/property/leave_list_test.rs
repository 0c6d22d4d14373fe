// tests/property/leave_list_test.rs

//! Leave-list discipline: after every applied event the leave list is
//! disjoint from the membership, and whenever a node reaches OK its
//! leave list is empty.

use crate::harness::{TestNode, TestPeers, form_cluster_with, wait_until};
use flockd::core::cluster::local::LocalNet;
use flockd::core::cluster::state::ClusterStatus;
use proptest::prelude::*;

fn check_discipline(nodes: &[TestNode]) {
    for node in nodes {
        let view = node.published.admission();
        for gone in &view.leave_nodes {
            assert!(
                !view.nodes.iter().any(|m| m.id == gone.id),
                "leave list overlaps membership on {}",
                node.node
            );
        }
        if view.status == ClusterStatus::Ok {
            assert!(
                view.leave_nodes.is_empty(),
                "running cluster carries leave entries on {}",
                node.node
            );
        }
    }
}

/// A cluster life: k founders, a few later joiners, a blackout, a first
/// wave of restarts in arbitrary order, one of them dying while the
/// cluster waits, and the rest returning.
fn arb_life() -> impl Strategy<Value = (usize, usize, Vec<usize>, usize, usize)> {
    (3usize..5, 0usize..3).prop_flat_map(|(k, adds)| {
        let total = k + adds;
        (2usize..total).prop_flat_map(move |wave| {
            (
                Just(k),
                Just(adds),
                Just((0..total).collect::<Vec<usize>>()).prop_shuffle(),
                Just(wave),
                0usize..wave,
            )
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 10,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_leave_list_stays_disjoint_and_empties_at_ok(
        (k, adds, order, wave, victim_pick) in arb_life()
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let net = LocalNet::new();
            let peers = TestPeers::new();
            let root = tempfile::tempdir().unwrap();

            let zones: Vec<u32> = (0..k as u32).collect();
            let mut cluster = form_cluster_with(&net, &peers, root.path(), &zones, 1, 0).await;
            check_discipline(&cluster);

            // Growth: fresh nodes join the running cluster.
            for add in 0..adds {
                let octet = (k + add + 1) as u8;
                let dir = root.path().join(format!("n{octet}"));
                cluster.push(TestNode::start(&net, &peers, &dir, octet, (k + add) as u32).await);
                for node in &cluster {
                    node.wait_members(k + add + 1).await;
                }
                check_discipline(&cluster);
            }
            let final_epoch = cluster[0].published.epoch();

            // Blackout: every task dies before any departure can be
            // sequenced, so every log stops at the same epoch.
            for node in &cluster {
                node.task.abort();
            }
            for node in &cluster {
                net.kill(&node.node.id);
            }

            // First wave of restarts reconstitutes a waiting cluster.
            let mut revived: Vec<TestNode> = Vec::new();
            for &slot in &order[..wave] {
                revived.push(TestNode::restart(&net, &peers, &cluster[slot]).await);
                let present = revived.len();
                for node in &revived {
                    node.wait_members(present).await;
                    node.wait_status(ClusterStatus::WaitForJoin).await;
                }
                check_discipline(&revived);
            }

            // One waiting member dies: no epoch can commit the departure,
            // so the survivors book it on the leave list.
            let victim = revived.remove(victim_pick);
            victim.crash(&net);
            for node in &revived {
                wait_until("the departure to reach the leave list", || {
                    node.published.admission().leave_nodes.len() == 1
                })
                .await;
            }
            check_discipline(&revived);

            // The rest of the old membership returns; the dead member is
            // written off and the cluster runs again under a new epoch.
            for &slot in &order[wave..] {
                revived.push(TestNode::restart(&net, &peers, &cluster[slot]).await);
            }
            for node in &revived {
                node.wait_status(ClusterStatus::Ok).await;
                node.wait_epoch(final_epoch + 1).await;
                assert!(node.published.admission().leave_nodes.is_empty());
            }
            check_discipline(&revived);
        });
    }
}
