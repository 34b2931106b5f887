//! End-to-end cluster scenarios over the in-memory network
//!
//! All tests run under paused tokio time, so the second-scale election
//! timeouts (1-2 seconds) advance instantly while staying faithful to the
//! timing bounds the scenarios assert against.

use std::time::Duration;

use raft_kernel::core::{MemberId, Role};
use raft_kernel::testing::TestCluster;

/// Timing bounds are phrased in election timeouts.
fn election_max(cluster: &TestCluster) -> Duration {
    cluster.config().election_timeout_max
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(start_paused = true)]
async fn three_node_happy_path() {
    init_tracing();
    let cluster = TestCluster::new(3).await;
    let ids = cluster.ids();

    let leader = cluster
        .wait_for_leader(3 * election_max(&cluster))
        .await
        .expect("a leader should be elected");

    let token = cluster
        .propose(leader, "x", "1")
        .await
        .expect("ready leader should accept the change");
    assert!(token.wait().await, "the change should commit");

    assert!(
        cluster
            .wait_for_value(&ids, "x", "1", 2 * election_max(&cluster))
            .await,
        "every member should apply x=1"
    );

    cluster.check_invariants().await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn commit_index_is_monotonic() {
    init_tracing();
    let cluster = TestCluster::new(3).await;
    let ids = cluster.ids();
    let leader = cluster
        .wait_for_leader(3 * election_max(&cluster))
        .await
        .unwrap();

    let mut watchers: Vec<_> = ids
        .iter()
        .map(|&id| cluster.member(id).committed_view())
        .collect();
    let mut high_water = vec![0u64; watchers.len()];

    for i in 0..5 {
        let token = cluster
            .propose(leader, &format!("k{i}"), &format!("v{i}"))
            .await
            .expect("leader should accept");
        assert!(token.wait().await);
        for (watcher, seen) in watchers.iter_mut().zip(high_water.iter_mut()) {
            let index = watcher.borrow_and_update().log_index;
            assert!(index >= *seen, "commit index went backwards");
            *seen = index;
        }
    }

    assert!(
        cluster
            .wait_for_value(&ids, "k4", "v4", 2 * election_max(&cluster))
            .await
    );
    cluster.check_invariants().await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn leader_failure_elects_a_successor_without_losing_entries() {
    init_tracing();
    let cluster = TestCluster::new(3).await;
    let ids = cluster.ids();

    let first_leader = cluster
        .wait_for_leader(3 * election_max(&cluster))
        .await
        .unwrap();
    let token = cluster.propose(first_leader, "x", "1").await.unwrap();
    assert!(token.wait().await);
    assert!(
        cluster
            .wait_for_value(&ids, "x", "1", 2 * election_max(&cluster))
            .await
    );

    // Cut the leader off from the rest.
    cluster.isolate(first_leader);
    let survivors: Vec<MemberId> = ids.iter().copied().filter(|&m| m != first_leader).collect();
    let second_leader = cluster
        .wait_for_leader_among(&survivors, 3 * election_max(&cluster))
        .await
        .expect("the surviving pair should elect a leader");
    assert_ne!(second_leader, first_leader);

    let token = cluster.propose(second_leader, "y", "2").await.unwrap();
    assert!(token.wait().await);
    assert!(
        cluster
            .wait_for_value(&survivors, "y", "2", 2 * election_max(&cluster))
            .await
    );

    // Healing lets the deposed leader converge without losing anything.
    cluster.heal(first_leader);
    assert!(
        cluster
            .wait_for_value(&ids, "y", "2", 4 * election_max(&cluster))
            .await,
        "the deposed leader should catch up"
    );
    assert!(
        cluster
            .wait_for_value(&ids, "x", "1", election_max(&cluster))
            .await,
        "committed entries must survive the leader change"
    );

    cluster.check_invariants().await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconfiguration_adds_a_member_in_two_phases() {
    init_tracing();
    let mut cluster = TestCluster::new(3).await;
    let mut ids = cluster.ids();
    let leader = cluster
        .wait_for_leader(3 * election_max(&cluster))
        .await
        .unwrap();

    // Track the configurations the committed view passes through.
    let mut committed_rx = cluster.member(leader).committed_view();
    let config_log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let config_log_writer = config_log.clone();
    let collector = tokio::spawn(async move {
        loop {
            let config = committed_rx.borrow_and_update().config.clone();
            {
                let mut log = config_log_writer.lock().unwrap();
                if log.last() != Some(&config) {
                    log.push(config);
                }
            }
            if committed_rx.changed().await.is_err() {
                return;
            }
        }
    });

    let new_id = cluster.add_member().await;
    ids.push(new_id);

    let ready_rx = cluster.member(leader).readiness_for_config_change();
    assert!(*ready_rx.borrow(), "no reconfiguration is in flight yet");

    let token = cluster
        .propose_config(leader, &ids)
        .await
        .expect("leader should accept the config change");

    // Property 9: a second config change cannot start while the first is
    // pending.
    assert!(
        cluster.propose_config(leader, &ids).await.is_none(),
        "a second reconfiguration must be refused while one is pending"
    );
    assert!(!*ready_rx.borrow());

    assert!(token.wait().await, "the joint entry should commit");

    // Between the joint commit and the plain-config commit the latest
    // view turns non-joint as soon as phase 2 is appended, but the
    // reconfiguration is still in flight: readiness must stay false and
    // further config changes must be refused for the whole window.
    let window_deadline = tokio::time::Instant::now() + 4 * election_max(&cluster);
    while cluster
        .member(leader)
        .committed_view()
        .borrow()
        .config
        .is_joint()
    {
        assert!(
            !*ready_rx.borrow(),
            "readiness must stay false until phase 2 commits"
        );
        assert!(
            cluster.propose_config(leader, &ids).await.is_none(),
            "no new reconfiguration may start before phase 2 commits"
        );
        assert!(
            tokio::time::Instant::now() < window_deadline,
            "phase 2 should commit"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The transition completes: committed config becomes plain {A,B,C,D}
    // and config-change readiness returns.
    assert!(
        cluster
            .wait_for_committed(&[leader], 4 * election_max(&cluster), |view| {
                !view.config.is_joint()
                    && view.config.current.voting.len() == 4
                    && view.config.current.is_member(new_id)
            })
            .await,
        "the plain four-member configuration should commit"
    );
    let deadline = tokio::time::Instant::now() + 2 * election_max(&cluster);
    while !*ready_rx.borrow() {
        assert!(tokio::time::Instant::now() < deadline, "readiness should return");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The committed view passed through the joint phase on its way.
    collector.abort();
    let seen = config_log.lock().unwrap().clone();
    assert!(
        seen.iter().any(|c| c.is_joint()),
        "the joint configuration should have been committed first"
    );
    let last = seen.last().unwrap();
    assert!(!last.is_joint());
    assert_eq!(last.current.voting.len(), 4);

    // The new member replicates too.
    let token = cluster.propose(leader, "after", "add").await.unwrap();
    assert!(token.wait().await);
    assert!(
        cluster
            .wait_for_value(&ids, "after", "add", 2 * election_max(&cluster))
            .await,
        "all four members, including the new one, should apply entries"
    );

    cluster.check_invariants().await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removing_the_leader_makes_it_step_down() {
    init_tracing();
    let cluster = TestCluster::new(4).await;
    let ids = cluster.ids();
    let leader = cluster
        .wait_for_leader(3 * election_max(&cluster))
        .await
        .unwrap();

    let remaining: Vec<MemberId> = ids.iter().copied().filter(|&m| m != leader).collect();
    let token = cluster
        .propose_config(leader, &remaining)
        .await
        .expect("leader should accept its own removal");
    assert!(token.wait().await, "the joint entry should commit");

    // The removed leader completes both phases, then steps down; a new
    // leader emerges from the remaining three.
    let successor = cluster
        .wait_for_leader_among(&remaining, 6 * election_max(&cluster))
        .await
        .expect("the remaining members should elect a leader");
    assert_ne!(successor, leader);

    assert!(
        cluster
            .wait_for_committed(&remaining, 2 * election_max(&cluster), |view| {
                !view.config.is_joint() && !view.config.current.is_member(leader)
            })
            .await,
        "the three-member configuration should commit everywhere"
    );
    let deadline = tokio::time::Instant::now() + 2 * election_max(&cluster);
    loop {
        let deposed = cluster.member(leader).status().await;
        if deposed.role != Role::Leader {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "the removed leader should step down"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let token = cluster.propose(successor, "post", "removal").await.unwrap();
    assert!(token.wait().await);

    cluster.check_invariants().await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lagging_member_catches_up_through_a_snapshot() {
    init_tracing();
    let cluster = TestCluster::new(3).await;
    let ids = cluster.ids();
    let leader = cluster
        .wait_for_leader(3 * election_max(&cluster))
        .await
        .unwrap();

    // Pick a follower and cut it off.
    let lagging = ids
        .iter()
        .copied()
        .find(|&m| m != leader)
        .expect("cluster has followers");
    cluster.isolate(lagging);
    let majority: Vec<MemberId> = ids.iter().copied().filter(|&m| m != lagging).collect();

    // Commit enough entries through the majority, then compact them away.
    for i in 0..20 {
        let token = cluster
            .propose(leader, &format!("s{i}"), &format!("{i}"))
            .await
            .expect("leader keeps a quorum without the lagging member");
        assert!(token.wait().await);
    }
    for &id in &majority {
        cluster
            .member(id)
            .take_snapshot()
            .await
            .expect("snapshot should succeed");
    }

    // Heal; the lagging member can only catch up via InstallSnapshot.
    cluster.heal(lagging);
    assert!(
        cluster
            .wait_for_value(&ids, "s19", "19", 6 * election_max(&cluster))
            .await,
        "the lagging member should converge through the snapshot"
    );

    let leader_view = cluster.member(leader).committed_view().borrow().clone();
    let lagging_view = cluster.member(lagging).committed_view().borrow().clone();
    assert_eq!(
        leader_view.state, lagging_view.state,
        "snapshot round-trip must reproduce the state"
    );
    assert_eq!(
        leader_view.config, lagging_view.config,
        "snapshot round-trip must reproduce the configuration"
    );

    cluster.check_invariants().await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn split_votes_eventually_resolve() {
    init_tracing();
    let cluster = TestCluster::new(4).await;
    let ids = cluster.ids();
    let leader = cluster
        .wait_for_leader(3 * election_max(&cluster))
        .await
        .unwrap();

    // Lose the leader; the three survivors start elections on loosely
    // synchronized timeouts. The randomized timeout must converge on a
    // single winner.
    cluster.isolate(leader);
    let survivors: Vec<MemberId> = ids.iter().copied().filter(|&m| m != leader).collect();
    let winner = cluster
        .wait_for_leader_among(&survivors, 10 * election_max(&cluster))
        .await
        .expect("randomized timeouts should resolve the split vote");

    let token = cluster.propose(winner, "split", "resolved").await.unwrap();
    assert!(token.wait().await);

    cluster.check_invariants().await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn proposals_on_followers_are_refused() {
    init_tracing();
    let cluster = TestCluster::new(3).await;
    let ids = cluster.ids();
    let leader = cluster
        .wait_for_leader(3 * election_max(&cluster))
        .await
        .unwrap();

    for id in ids {
        if id == leader {
            continue;
        }
        assert!(
            cluster.propose(id, "nope", "nope").await.is_none(),
            "followers must refuse proposals"
        );
    }
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn minority_partition_cannot_commit() {
    init_tracing();
    let cluster = TestCluster::new(3).await;
    let ids = cluster.ids();
    let leader = cluster
        .wait_for_leader(3 * election_max(&cluster))
        .await
        .unwrap();
    let token = cluster.propose(leader, "x", "1").await.unwrap();
    assert!(token.wait().await);

    // Isolate the leader, then propose through it while it still thinks
    // it leads: the change must not commit, and the token must resolve
    // (to failure) once the leader notices it lost its quorum.
    cluster.isolate(leader);
    let maybe_token = cluster.propose(leader, "x", "2").await;
    if let Some(token) = maybe_token {
        assert!(
            !token.wait().await,
            "an isolated leader must abandon its proposals"
        );
    }

    let survivors: Vec<MemberId> = ids.iter().copied().filter(|&m| m != leader).collect();
    let new_leader = cluster
        .wait_for_leader_among(&survivors, 3 * election_max(&cluster))
        .await
        .unwrap();
    let token = cluster.propose(new_leader, "x", "3").await.unwrap();
    assert!(token.wait().await);

    cluster.heal(leader);
    assert!(
        cluster
            .wait_for_value(&ids, "x", "3", 4 * election_max(&cluster))
            .await,
        "the healed member must converge on the majority's value"
    );

    cluster.check_invariants().await;
    cluster.shutdown().await;
}
