// tests/property/placement_test.rs

//! Placement invariants of the vnode snapshot: zone counting and replica
//! distinctness hold for arbitrary memberships.

use flockd::core::cluster::node::{Node, sort_nodes};
use flockd::core::cluster::vnodes::VnodeSnapshot;
use proptest::prelude::*;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

fn arb_membership() -> impl Strategy<Value = Vec<Node>> {
    // Distinct final octets give distinct identities.
    prop::collection::btree_map(1u8..240, (0u32..6, 0u16..96), 1..12).prop_map(|spec| {
        let mut nodes: Vec<Node> = spec
            .into_iter()
            .map(|(octet, (zone, weight))| {
                Node::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)), 7000, zone, weight)
            })
            .collect();
        sort_nodes(&mut nodes);
        nodes
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_nr_zones_matches_data_carrying_zone_set(nodes in arb_membership()) {
        let snapshot = VnodeSnapshot::build(&nodes);
        let zones: HashSet<u32> = nodes
            .iter()
            .filter(|n| !n.is_gateway())
            .map(|n| n.zone)
            .collect();
        prop_assert_eq!(snapshot.nr_zones(), zones.len());
    }

    #[test]
    fn test_locate_yields_distinct_registry_nodes(
        nodes in arb_membership(),
        oid in any::<u64>(),
    ) {
        let snapshot = VnodeSnapshot::build(&nodes);
        let data_nodes = nodes.iter().filter(|n| !n.is_gateway()).count();

        for copies in 1..=data_nodes.min(4) {
            let replicas = snapshot.locate(oid, copies);
            prop_assert_eq!(replicas.len(), copies);
            let ids: HashSet<_> = replicas.iter().map(|n| n.id).collect();
            prop_assert_eq!(ids.len(), copies);
            for replica in &replicas {
                prop_assert!(nodes.contains(replica));
                prop_assert!(!replica.is_gateway());
            }
        }
    }

    #[test]
    fn test_locate_is_stable_for_equal_oids(
        nodes in arb_membership(),
        oid in any::<u64>(),
    ) {
        let snapshot = VnodeSnapshot::build(&nodes);
        prop_assert_eq!(snapshot.locate(oid, 3), snapshot.locate(oid, 3));
    }
}
