// tests/property/log_test.rs

//! The epoch log returns exactly what was committed, for arbitrary
//! histories, across appends and reopens.

use flockd::core::cluster::epoch_log::EpochLog;
use flockd::core::cluster::node::{Node, sort_nodes};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

fn arb_entry() -> impl Strategy<Value = Vec<Node>> {
    prop::collection::btree_set(1u8..200, 1..8).prop_map(|octets| {
        let mut nodes: Vec<Node> = octets
            .into_iter()
            .map(|octet| {
                Node::new(
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)),
                    7000,
                    u32::from(octet % 5),
                    64,
                )
            })
            .collect();
        sort_nodes(&mut nodes);
        nodes
    })
}

fn arb_history() -> impl Strategy<Value = BTreeMap<u32, Vec<Node>>> {
    prop::collection::btree_map(1u32..60, arb_entry(), 1..8)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_log_round_trips_arbitrary_histories(history in arb_history()) {
        let dir = tempfile::tempdir().unwrap();
        let mut log = EpochLog::open(dir.path()).unwrap();
        for (&epoch, nodes) in &history {
            log.append(epoch, nodes).unwrap();
        }

        let highest = *history.keys().last().unwrap();
        prop_assert_eq!(log.latest(), highest);
        for (&epoch, nodes) in &history {
            prop_assert_eq!(&log.read(epoch), nodes);
        }

        // A reopen recovers the same state from disk.
        let reopened = EpochLog::open(dir.path()).unwrap();
        prop_assert_eq!(reopened.latest(), highest);
        for (&epoch, nodes) in &history {
            prop_assert_eq!(&reopened.read(epoch), nodes);
        }
    }
}
