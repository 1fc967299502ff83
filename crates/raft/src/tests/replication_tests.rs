use super::*;
use crate::{HardState, RaftError};

fn append(prev: (u64, u64), entries: Vec<Entry>, leader_commit: u64) -> MessageBody {
    MessageBody::AppendEntries {
        prev_log_index: prev.0,
        prev_log_term: prev.1,
        entries,
        leader_commit,
        read_ctx: 1,
    }
}

fn noops(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<Entry> {
    range.map(|i| Entry::new(i, term, Command::Noop)).collect()
}

fn append_result(messages: &[Message]) -> Option<(bool, u64, u64)> {
    messages.iter().find_map(|m| match m.body {
        MessageBody::AppendEntriesResponse {
            success,
            match_index,
            reject_hint,
            ..
        } => Some((success, match_index, reject_hint)),
        _ => None,
    })
}

#[test]
fn puts_reach_every_node_in_order() {
    let mut c = Cluster::new(&[1, 2, 3]);
    c.put("a", "1");
    c.put("a", "2");
    c.put("b", "x");
    c.run(3);
    for id in [1, 2, 3] {
        assert_eq!(c.get(id, "a").as_deref(), Some("2"));
        assert_eq!(c.get(id, "b").as_deref(), Some("x"));
    }
    c.assert_applied_consistent();
}

#[test]
fn delete_removes_key_everywhere() {
    let mut c = Cluster::new(&[1, 2, 3]);
    c.put("gone", "soon");
    let leader = c.wait_for_leader();
    let sequence = c.node(leader).next_index();
    c.propose(Command::Delete {
        key: b"gone".to_vec(),
        sequence,
    });
    c.run(3);
    for id in [1, 2, 3] {
        assert_eq!(c.get(id, "gone"), None);
    }
}

#[test]
fn follower_rejects_append_past_its_log() {
    let mut node = new_node(1, &[1, 2, 3]);
    node.step(msg(2, 1, 1, append((3, 1), noops(4..=4, 1), 0)))
        .unwrap();
    let (success, _, hint) = append_result(&take_messages(&mut node)).unwrap();
    assert!(!success);
    assert_eq!(hint, 0, "hint points at the follower's last index");
    assert_eq!(node.leader(), Some(2));
}

#[test]
fn follower_rejects_append_with_mismatched_term() {
    let mut node = new_node(1, &[1, 2, 3]);
    node.storage_mut().append(&noops(1..=3, 1)).unwrap();
    node.step(msg(2, 1, 2, append((3, 2), vec![], 0))).unwrap();
    let (success, _, hint) = append_result(&take_messages(&mut node)).unwrap();
    assert!(!success);
    assert_eq!(hint, 2);
}

#[test]
fn conflicting_suffix_is_truncated() {
    let mut node = new_node(1, &[1, 2, 3]);
    node.storage_mut().append(&noops(1..=3, 1)).unwrap();

    node.step(msg(2, 1, 2, append((1, 1), noops(2..=2, 2), 0)))
        .unwrap();
    assert_eq!(append_result(&take_messages(&mut node)), Some((true, 2, 0)));
    assert_eq!(node.last_index(), 2);
    assert_eq!(node.storage().term(2).unwrap(), Some(2));
}

#[test]
fn matching_prefix_does_not_truncate() {
    let mut node = new_node(1, &[1, 2, 3]);
    node.storage_mut().append(&noops(1..=3, 1)).unwrap();

    // a delayed append carrying only a prefix of what is stored
    node.step(msg(2, 1, 1, append((0, 0), noops(1..=1, 1), 0)))
        .unwrap();
    assert_eq!(append_result(&take_messages(&mut node)), Some((true, 1, 0)));
    assert_eq!(node.last_index(), 3);
}

#[test]
fn follower_commit_stops_at_last_new_entry() {
    let mut node = new_node(1, &[1, 2, 3]);
    node.step(msg(2, 1, 1, append((0, 0), noops(1..=2, 1), 10)))
        .unwrap();
    assert_eq!(node.commit_index(), 2);
    assert_eq!(node.storage().hard_state().commit, 2);
    let rd = node.ready().unwrap();
    assert_eq!(rd.committed_entries.len(), 2);
}

#[test]
fn leader_only_commits_entries_of_its_term() {
    let mut storage = MemStorage::new();
    storage
        .append(&[Entry::new(1, 1, Command::Noop), Entry::new(2, 2, Command::Noop)])
        .unwrap();
    storage
        .save_hard_state(&HardState {
            term: 2,
            voted_for: None,
            commit: 0,
        })
        .unwrap();
    init_tracing();
    let mut node = RaftNode::new(1, test_config(), storage, &[1, 2, 3], 0).unwrap();

    node.campaign(false).unwrap();
    node.step(msg(2, 1, 3, MessageBody::RequestVoteResponse { granted: true }))
        .unwrap();
    assert!(node.is_leader());
    assert_eq!(node.last_index(), 3, "noop appended on election");
    take_messages(&mut node);

    let ack = |match_index| {
        msg(
            2,
            1,
            3,
            MessageBody::AppendEntriesResponse {
                success: true,
                match_index,
                reject_hint: 0,
                read_ctx: 1,
            },
        )
    };
    // a quorum holds index 2, but it belongs to an older term
    node.step(ack(2)).unwrap();
    assert_eq!(node.commit_index(), 0);

    node.step(ack(3)).unwrap();
    assert_eq!(node.commit_index(), 3);
}

#[test]
fn committed_entry_survives_leader_crash() {
    let mut c = Cluster::new(&[1, 2, 3]);
    let old = c.wait_for_leader();
    let mut followers = [1, 2, 3].into_iter().filter(|id| *id != old);
    let (holder, lagger) = (followers.next().unwrap(), followers.next().unwrap());

    c.cut.insert((old, lagger));
    let index = c.put("x", "kept");
    assert!(c.node(old).commit_index() >= index);
    assert_eq!(c.node(lagger).last_index(), index - 1);

    c.crash(old);
    let new = c.wait_for_leader();
    assert_eq!(new, holder, "only the node holding the entry can win");
    c.run(5);
    assert_eq!(c.get(new, "x").as_deref(), Some("kept"));
    assert_eq!(c.get(lagger, "x").as_deref(), Some("kept"));
    c.assert_single_leader_per_term();
    c.assert_applied_consistent();
}

#[test]
fn restarted_follower_catches_up_in_batches() {
    let mut c = Cluster::new(&[1, 2, 3]);
    let leader = c.wait_for_leader();
    let follower = if leader == 3 { 2 } else { 3 };
    c.crash(follower);
    for i in 0..40 {
        c.put(&format!("k{:02}", i), &i.to_string());
    }
    c.restart(follower);
    c.run(20);

    assert_eq!(c.get(follower, "k39").as_deref(), Some("39"));
    c.assert_converged();
    c.assert_applied_consistent();
    let max = c.config.max_entries_per_append;
    for m in &c.sent {
        if let MessageBody::AppendEntries { entries, .. } = &m.body {
            assert!(entries.len() <= max, "batch of {}", entries.len());
        }
    }
}

#[test]
fn proposal_on_follower_points_at_leader() {
    let mut c = Cluster::new(&[1, 2, 3]);
    let leader = c.wait_for_leader();
    let follower = if leader == 1 { 2 } else { 1 };
    let err = c
        .node_mut(follower)
        .propose(put("a", "1", 1))
        .unwrap_err();
    assert!(matches!(
        err,
        RaftError::NotLeader { leader_hint: Some(l) } if l == leader
    ));
}

#[test]
fn membership_command_cannot_be_proposed_directly() {
    let mut c = Cluster::new(&[1]);
    let leader = c.wait_for_leader();
    let err = c
        .node_mut(leader)
        .propose(Command::MembershipChange(crate::Membership::new([1, 2])))
        .unwrap_err();
    assert!(matches!(err, RaftError::InvalidMembership(_)));
}
