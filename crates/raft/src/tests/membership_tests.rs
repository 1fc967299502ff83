use super::*;
use crate::{Membership, RaftError};

fn set(ids: &[NodeId]) -> BTreeSet<NodeId> {
    ids.iter().copied().collect()
}

fn membership_entries(c: &Cluster, id: NodeId) -> Vec<Membership> {
    c.entries_on(id)
        .into_iter()
        .filter_map(|e| match e.command {
            Command::MembershipChange(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn change(c: &mut Cluster, voters: &[NodeId]) -> u64 {
    let leader = c.wait_for_leader();
    let index = c.node_mut(leader).propose_membership(set(voters)).unwrap();
    c.process(leader);
    c.deliver();
    index
}

#[test]
fn voter_added_through_joint_configuration() {
    let mut c = Cluster::with_config(&[1, 2, 3, 4], &[1, 2, 3], test_config());
    c.put("before", "1");
    change(&mut c, &[1, 2, 3, 4]);
    c.run(10);

    let leader = c.wait_for_leader();
    let history = membership_entries(&c, leader);
    assert_eq!(history.len(), 2);
    assert!(history[0].is_joint());
    assert_eq!(history[1], Membership::new([1, 2, 3, 4]));
    for id in [1, 2, 3, 4] {
        assert_eq!(c.node(id).membership(), &Membership::new([1, 2, 3, 4]));
    }

    c.put("after", "2");
    c.run(3);
    assert_eq!(c.get(4, "before").as_deref(), Some("1"));
    assert_eq!(c.get(4, "after").as_deref(), Some("2"));
    c.assert_converged();
}

#[test]
fn one_change_at_a_time() {
    let mut c = Cluster::with_config(&[1, 2, 3, 4, 5], &[1, 2, 3], test_config());
    let leader = c.wait_for_leader();
    c.node_mut(leader)
        .propose_membership(set(&[1, 2, 3, 4]))
        .unwrap();
    let err = c
        .node_mut(leader)
        .propose_membership(set(&[1, 2, 3, 5]))
        .unwrap_err();
    assert!(matches!(err, RaftError::MembershipChangeInProgress));

    c.process(leader);
    c.deliver();
    c.run(10);
    change(&mut c, &[1, 2, 3, 4, 5]);
    c.run(10);
    let leader = c.wait_for_leader();
    assert_eq!(
        c.node(leader).membership(),
        &Membership::new([1, 2, 3, 4, 5])
    );
}

#[test]
fn invalid_configurations_are_refused() {
    let mut c = Cluster::new(&[1, 2, 3]);
    let leader = c.wait_for_leader();
    let node = c.node_mut(leader);
    for voters in [set(&[]), set(&[0, 1]), set(&[1, 2, 3])] {
        let err = node.propose_membership(voters).unwrap_err();
        assert!(matches!(err, RaftError::InvalidMembership(_)), "{:?}", err);
    }

    let follower = if leader == 1 { 2 } else { 1 };
    let err = c
        .node_mut(follower)
        .propose_membership(set(&[1, 2]))
        .unwrap_err();
    assert!(matches!(err, RaftError::NotLeader { .. }));
}

#[test]
fn removed_leader_steps_down() {
    let mut c = Cluster::new(&[1, 2, 3]);
    let old = c.wait_for_leader();
    let rest: Vec<NodeId> = [1, 2, 3].into_iter().filter(|id| *id != old).collect();
    change(&mut c, &rest);
    c.run(60);

    assert!(!c.node(old).is_leader());
    let new = c.wait_for_leader();
    assert!(rest.contains(&new));
    assert_eq!(c.node(new).membership(), &Membership::new(rest.clone()));

    c.put("k", "v");
    c.run(3);
    for id in &rest {
        assert_eq!(c.get(*id, "k").as_deref(), Some("v"));
    }
    assert_eq!(c.get(old, "k"), None, "removed node no longer replicates");
    c.run(100);
    assert!(!c.node(old).is_leader(), "removed node never campaigns");
    c.assert_single_leader_per_term();
}

#[test]
fn joint_configuration_needs_both_majorities() {
    let mut c = Cluster::with_config(&[1, 2, 3, 4, 5], &[1, 2, 3], test_config());
    c.wait_for_leader();
    c.crash(4);
    c.crash(5);
    let joint_index = change(&mut c, &[3, 4, 5]);
    c.run(30);
    for id in [1, 2, 3] {
        assert!(
            c.node(id).commit_index() < joint_index,
            "node {} committed the joint entry without the new majority",
            id
        );
        assert!(c.node(id).membership().is_joint());
    }

    c.restart(4);
    c.restart(5);
    c.run(200);
    let leader = c.wait_for_leader();
    assert!([3, 4, 5].contains(&leader));
    for id in [3, 4, 5] {
        assert_eq!(c.node(id).membership(), &Membership::new([3, 4, 5]));
    }
    c.assert_single_leader_per_term();
    c.assert_applied_consistent();
}

#[test]
fn membership_restored_from_log_and_snapshot() {
    let mut c = Cluster::with_config(&[1, 2, 3, 4], &[1, 2, 3], test_config());
    change(&mut c, &[1, 2, 3, 4]);
    c.run(10);
    let leader = c.wait_for_leader();
    let follower = if leader == 2 { 3 } else { 2 };

    c.restart(follower);
    assert_eq!(c.node(follower).membership(), &Membership::new([1, 2, 3, 4]));

    c.run(5);
    c.snapshot(follower);
    assert!(membership_entries(&c, follower).is_empty(), "log compacted");
    c.restart(follower);
    assert_eq!(c.node(follower).membership(), &Membership::new([1, 2, 3, 4]));
}
