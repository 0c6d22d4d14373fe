// tests/property/admission_test.rs

//! Admission is a pure function: the same view and claim always produce
//! the same decision, and prior members of one history admit each other.

use flockd::core::cluster::admission::{JoinVerdict, check_join};
use flockd::core::cluster::node::{Node, sort_nodes};
use flockd::core::cluster::payload::JoinMessage;
use flockd::core::cluster::state::{AdmissionView, ClusterStatus};
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};

const CTIME: u64 = 0x5eed_0000_0000_0001;

fn node(octet: u8) -> Node {
    Node::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)),
        7000,
        u32::from(octet % 4),
        64,
    )
}

fn arb_status() -> impl Strategy<Value = ClusterStatus> {
    prop::sample::select(vec![
        ClusterStatus::WaitForFormat,
        ClusterStatus::WaitForJoin,
        ClusterStatus::Ok,
        ClusterStatus::Halt,
    ])
}

fn arb_octets() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::btree_set(1u8..30, 1..8).prop_map(|s| s.into_iter().collect())
}

fn sorted_nodes(octets: &[u8]) -> Vec<Node> {
    let mut nodes: Vec<Node> = octets.iter().map(|&o| node(o)).collect();
    sort_nodes(&mut nodes);
    nodes
}

fn claim(epoch: u32, ctime: u64, nodes: Vec<Node>) -> JoinMessage {
    JoinMessage {
        nr_copies: 3,
        cluster_flags: 0,
        cluster_status: ClusterStatus::WaitForJoin,
        epoch,
        ctime,
        result: 0,
        inc_epoch: false,
        store: "plain".to_string(),
        nodes,
        leave_nodes: Vec::new(),
    }
}

fn view(
    status: ClusterStatus,
    epoch: u32,
    members: Vec<Node>,
    last_entry: Vec<Node>,
) -> AdmissionView {
    AdmissionView {
        status,
        ctime: CTIME,
        epoch,
        nr_copies: 3,
        cluster_flags: 0,
        store: "plain".to_string(),
        nodes: members,
        leave_nodes: Vec::new(),
        last_entry,
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_admission_is_deterministic(
        status in arb_status(),
        view_epoch in 0u32..8,
        claim_epoch in 0u32..8,
        members in arb_octets(),
        entry in arb_octets(),
        claimed in arb_octets(),
        same_ctime in any::<bool>(),
        joiner_octet in 31u8..40,
    ) {
        let v = view(status, view_epoch, sorted_nodes(&members), sorted_nodes(&entry));
        let ctime = if same_ctime { CTIME } else { CTIME + 1 };
        let msg = claim(claim_epoch, ctime, sorted_nodes(&claimed));
        let joiner = node(joiner_octet);

        let first = check_join(&v, &joiner, &msg);
        let second = check_join(&v, &joiner, &msg);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn test_prior_members_of_one_history_admit_each_other(
        entry_octets in prop::collection::btree_set(1u8..30, 2..8),
        epoch in 1u32..8,
    ) {
        // A and B are both members of the logged epoch; each one, waiting
        // alone, admits the other with the same verdict.
        let octets: Vec<u8> = entry_octets.into_iter().collect();
        let entry = sorted_nodes(&octets);
        let a = entry[0];
        let b = entry[1];

        let view_a = view(ClusterStatus::WaitForJoin, epoch, vec![a], entry.clone());
        let view_b = view(ClusterStatus::WaitForJoin, epoch, vec![b], entry.clone());
        let a_admits_b = check_join(&view_a, &b, &claim(epoch, CTIME, entry.clone()));
        let b_admits_a = check_join(&view_b, &a, &claim(epoch, CTIME, entry.clone()));

        prop_assert_eq!(a_admits_b.verdict, b_admits_a.verdict);
        prop_assert_eq!(a_admits_b.verdict, JoinVerdict::Success);
    }

    #[test]
    fn test_fresh_claims_never_fail_history_checks(
        status in arb_status(),
        view_epoch in 0u32..8,
        members in arb_octets(),
        entry in arb_octets(),
    ) {
        let v = view(status, view_epoch, sorted_nodes(&members), sorted_nodes(&entry));
        let msg = claim(0, 0, Vec::new());
        let decision = check_join(&v, &node(42), &msg);
        // A fresh node is admitted or told to wait, never rejected for
        // its (nonexistent) history.
        prop_assert!(matches!(
            decision.verdict,
            JoinVerdict::Success | JoinVerdict::JoinLater
        ));
    }
}
