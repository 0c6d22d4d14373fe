use flockd::core::cluster::epoch_log::EpochLog;
use flockd::core::cluster::node::{Node, sort_nodes};
use std::net::{IpAddr, Ipv4Addr};

fn members(count: u8) -> Vec<Node> {
    let mut nodes: Vec<Node> = (1..=count)
        .map(|i| {
            Node::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)),
                7000,
                u32::from(i),
                64,
            )
        })
        .collect();
    sort_nodes(&mut nodes);
    nodes
}

#[test]
fn test_empty_log_has_epoch_zero() {
    let dir = tempfile::tempdir().unwrap();
    let log = EpochLog::open(dir.path()).unwrap();
    assert_eq!(log.latest(), 0);
    assert!(log.read(1).is_empty());
}

#[test]
fn test_append_then_read_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = EpochLog::open(dir.path()).unwrap();
    let nodes = members(3);
    log.append(1, &nodes).unwrap();
    assert_eq!(log.latest(), 1);
    assert_eq!(log.read(1), nodes);
}

#[test]
fn test_append_is_idempotent_for_same_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = EpochLog::open(dir.path()).unwrap();
    let nodes = members(3);
    log.append(1, &nodes).unwrap();
    log.append(1, &nodes).unwrap();
    assert_eq!(log.read(1), nodes);
}

#[test]
fn test_committed_entry_is_immutable() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = EpochLog::open(dir.path()).unwrap();
    log.append(1, &members(3)).unwrap();
    assert!(log.append(1, &members(4)).is_err());
    // The original entry is untouched.
    assert_eq!(log.read(1), members(3));
}

#[test]
fn test_latest_tracks_highest_committed_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = EpochLog::open(dir.path()).unwrap();
    log.append(1, &members(3)).unwrap();
    log.append(2, &members(4)).unwrap();
    log.append(3, &members(2)).unwrap();
    assert_eq!(log.latest(), 3);
    assert_eq!(log.read(2), members(4));
}

#[test]
fn test_reopen_recovers_latest_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut log = EpochLog::open(dir.path()).unwrap();
        log.append(1, &members(3)).unwrap();
        log.append(2, &members(4)).unwrap();
    }
    let log = EpochLog::open(dir.path()).unwrap();
    assert_eq!(log.latest(), 2);
    assert_eq!(log.read(1), members(3));
    assert_eq!(log.read(2), members(4));
}

#[test]
fn test_read_of_absent_epoch_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = EpochLog::open(dir.path()).unwrap();
    log.append(2, &members(3)).unwrap();
    assert!(log.read(1).is_empty());
    assert!(log.read(3).is_empty());
}
