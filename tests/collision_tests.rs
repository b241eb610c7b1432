
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use grid_placement::collision::CollisionResolver;
use grid_placement::config::StealingConfig;
use grid_placement::message::StealRequest;
use grid_placement::scheduler::{JobHandle, JobSpec, JobState};
use grid_placement::topology::{AttributeFilter, DiscoveryEvent, GridNode, SessionTopologies};
use test_harness::{busy_peer, waiting_jobs, ResolverFixture};

fn busy_config() -> StealingConfig {
    StealingConfig::default()
        .with_active_jobs_threshold(0)
        .with_wait_jobs_threshold(0)
}

// =============================================================================
// Busy path: activation and rejection
// =============================================================================

#[test]
fn test_activates_up_to_threshold() {
    let fx = ResolverFixture::new(StealingConfig::default().with_active_jobs_threshold(2));
    let jobs = waiting_jobs(3, Uuid::new_v4());

    let outcome = fx.resolver.on_collision(&jobs, &[]);

    assert_eq!(outcome.activated, 2);
    assert_eq!(outcome.rejected, 0);
    assert_eq!(jobs[0].state(), JobState::Active);
    assert_eq!(jobs[1].state(), JobState::Active);
    assert_eq!(jobs[2].state(), JobState::Waiting);
    assert_eq!(fx.resolver.steal_requests(), 0);
}

#[test]
fn test_active_jobs_count_against_threshold() {
    let fx = ResolverFixture::new(StealingConfig::default().with_active_jobs_threshold(2));
    let session = Uuid::new_v4();
    let active = waiting_jobs(1, session);
    active[0].activate();
    let jobs = waiting_jobs(3, session);

    let outcome = fx.resolver.on_collision(&jobs, &active);

    assert_eq!(outcome.activated, 1);
    assert_eq!(jobs[1].state(), JobState::Waiting);
}

#[test]
fn test_rejects_to_requesting_peer() {
    let fx = ResolverFixture::new(busy_config());
    let thief = GridNode::random();
    fx.join(thief.clone());

    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 3 });
    assert_eq!(fx.resolver.steal_requests(), 3);

    let jobs = waiting_jobs(5, Uuid::new_v4());
    let outcome = fx.resolver.on_collision(&jobs, &[]);

    assert_eq!(outcome.rejected, 3);
    for job in &jobs[..3] {
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(job.thief(), Some(thief.id));
        assert_eq!(job.stealing_attempts(), 1);
    }
    for job in &jobs[3..] {
        assert_eq!(job.state(), JobState::Waiting);
        assert!(job.thief().is_none());
    }

    assert_eq!(fx.resolver.steal_requests(), 0);
    assert_eq!(fx.resolver.received_requests().jobs_to_steal(&thief.id), Some(0));
    assert_eq!(fx.resolver.metrics().total_stolen_jobs, 3);
}

#[test]
fn test_wait_threshold_keeps_jobs_local() {
    let fx = ResolverFixture::new(busy_config().with_wait_jobs_threshold(3));
    let thief = GridNode::random();
    fx.join(thief.clone());
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 5 });

    let jobs = waiting_jobs(5, Uuid::new_v4());
    let outcome = fx.resolver.on_collision(&jobs, &[]);

    assert_eq!(outcome.rejected, 2);
    assert_eq!(fx.resolver.steal_requests(), 3);
}

#[test]
fn test_job_lost_to_overlapping_pass_frees_one_more_for_thieves() {
    let fx = ResolverFixture::new(
        StealingConfig::default()
            .with_active_jobs_threshold(2)
            .with_wait_jobs_threshold(1),
    );
    let thief = GridNode::random();
    fx.join(thief.clone());
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 5 });

    let jobs = waiting_jobs(5, Uuid::new_v4());
    // Another pass already handed this one away.
    assert!(jobs[0].cancel());

    let outcome = fx.resolver.on_collision(&jobs, &[]);

    assert_eq!(outcome.activated, 1);
    assert_eq!(jobs[1].state(), JobState::Active);
    assert_eq!(outcome.rejected, 3);
    for job in &jobs[2..] {
        assert_eq!(job.thief(), Some(thief.id));
    }
    assert_eq!(fx.resolver.steal_requests(), 2);
}

#[test]
fn test_stealing_disabled_jobs_stay() {
    let fx = ResolverFixture::new(busy_config());
    let thief = GridNode::random();
    fx.join(thief.clone());
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 2 });

    let session = Uuid::new_v4();
    let pinned = Arc::new(JobHandle::new(
        session,
        Uuid::new_v4(),
        JobSpec::new().with_stealing_disabled(),
    ));
    let free = Arc::new(JobHandle::new(session, Uuid::new_v4(), JobSpec::new()));

    let outcome = fx.resolver.on_collision(&[pinned.clone(), free.clone()], &[]);

    assert_eq!(outcome.rejected, 1);
    assert_eq!(pinned.state(), JobState::Waiting);
    assert_eq!(free.state(), JobState::Cancelled);
    assert_eq!(fx.resolver.steal_requests(), 1);
}

#[test]
fn test_max_stealing_attempts_respected() {
    let fx = ResolverFixture::new(busy_config().with_max_stealing_attempts(2));
    let thief = GridNode::random();
    fx.join(thief.clone());
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 1 });

    let worn = Arc::new(
        JobHandle::new(Uuid::new_v4(), Uuid::new_v4(), JobSpec::new()).with_attempts(2, 0),
    );
    let outcome = fx.resolver.on_collision(&[worn.clone()], &[]);

    assert_eq!(outcome.rejected, 0);
    assert_eq!(worn.state(), JobState::Waiting);
    assert_eq!(fx.resolver.steal_requests(), 1);
}

#[test]
fn test_peer_outside_task_topology_is_skipped() {
    let sessions = Arc::new(SessionTopologies::new());
    let fx = ResolverFixture::with_task_topology(busy_config(), sessions.clone());
    let thief = GridNode::random();
    let other = GridNode::random();
    fx.join(thief.clone());
    fx.join(other.clone());

    let session = Uuid::new_v4();
    sessions.register(session, [other.id]);
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 2 });

    let jobs = waiting_jobs(2, session);
    let outcome = fx.resolver.on_collision(&jobs, &[]);

    assert_eq!(outcome.rejected, 0);
    assert!(jobs.iter().all(|j| j.state() == JobState::Waiting));
    assert_eq!(fx.resolver.steal_requests(), 2);
}

#[test]
fn test_already_activated_job_is_not_stolen() {
    let fx = ResolverFixture::new(busy_config());
    let thief = GridNode::random();
    fx.join(thief.clone());
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 1 });

    // Another pass got there first.
    let jobs = waiting_jobs(1, Uuid::new_v4());
    assert!(jobs[0].activate());

    let outcome = fx.resolver.on_collision(&jobs, &[]);
    assert_eq!(outcome.rejected, 0);
    assert!(jobs[0].thief().is_none());
    assert_eq!(fx.resolver.steal_requests(), 1);
}

// =============================================================================
// Steal request bookkeeping
// =============================================================================

#[test]
fn test_new_request_replaces_previous() {
    let fx = ResolverFixture::new(busy_config());
    let thief = GridNode::random();
    fx.join(thief.clone());

    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 3 });
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 1 });
    assert_eq!(fx.resolver.steal_requests(), 1);

    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 5 });
    assert_eq!(fx.resolver.steal_requests(), 5);
    assert_eq!(fx.resolver.received_requests().total(), 5);
}

#[test]
fn test_request_from_unknown_node_is_ignored() {
    let fx = ResolverFixture::new(busy_config());
    fx.resolver
        .on_steal_request(Uuid::new_v4(), StealRequest { delta: 4 });
    assert_eq!(fx.resolver.steal_requests(), 0);
    assert!(fx.resolver.received_requests().is_empty());
}

#[test]
fn test_steal_request_fires_listener() {
    let fx = ResolverFixture::new(busy_config());
    let thief = GridNode::random();
    fx.join(thief.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    fx.resolver.set_external_listener(Some(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 1 });
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 0 });
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    fx.resolver.set_external_listener(None);
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 1 });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_expired_request_rolled_back_on_next_pass() {
    let fx = ResolverFixture::new(
        busy_config().with_message_expire_time(Duration::from_millis(30)),
    );
    let thief = GridNode::random();
    fx.join(thief.clone());
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 3 });

    std::thread::sleep(Duration::from_millis(60));

    let jobs = waiting_jobs(3, Uuid::new_v4());
    let outcome = fx.resolver.on_collision(&jobs, &[]);

    assert_eq!(outcome.rejected, 0);
    assert_eq!(fx.resolver.steal_requests(), 0);
    assert_eq!(fx.resolver.received_requests().jobs_to_steal(&thief.id), Some(0));
}

#[test]
fn test_request_never_revisited_stays_stale() {
    let fx = ResolverFixture::new(
        busy_config().with_message_expire_time(Duration::from_millis(10)),
    );
    let thief = GridNode::random();
    fx.join(thief.clone());
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 3 });

    std::thread::sleep(Duration::from_millis(30));

    // Expiry is lazy: without a collision pass nothing rolls back.
    assert_eq!(fx.resolver.steal_requests(), 3);
    assert_eq!(fx.resolver.metrics().current_steal_requests, 3);
}

#[test]
fn test_departed_peer_request_rolled_back() {
    let fx = ResolverFixture::new(busy_config());
    let thief = GridNode::random();
    fx.join(thief.clone());
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 4 });

    fx.topology.remove(&thief.id);
    fx.resolver.on_discovery_event(&DiscoveryEvent::failed(thief.clone()));

    assert_eq!(fx.resolver.steal_requests(), 0);
    assert!(fx.resolver.received_requests().jobs_to_steal(&thief.id).is_none());
}

#[test]
fn test_peer_missing_from_topology_dropped_during_pass() {
    let fx = ResolverFixture::new(busy_config());
    let thief = GridNode::random();
    fx.join(thief.clone());
    fx.resolver.on_steal_request(thief.id, StealRequest { delta: 2 });

    // Left without a discovery event reaching the resolver.
    fx.topology.remove(&thief.id);

    let jobs = waiting_jobs(2, Uuid::new_v4());
    let outcome = fx.resolver.on_collision(&jobs, &[]);

    assert_eq!(outcome.rejected, 0);
    assert_eq!(fx.resolver.steal_requests(), 0);
}

// =============================================================================
// Idle path: asking peers for work
// =============================================================================

#[test]
fn test_idle_requests_min_of_delta_and_capacity() {
    let fx = ResolverFixture::new(StealingConfig::default().with_active_jobs_threshold(2));
    let peer = busy_peer(5, 0);
    fx.join(peer.clone());

    let outcome = fx.resolver.on_collision(&[], &[]);

    assert_eq!(outcome.requested, 2);
    assert_eq!(fx.messaging.steal_requests(), vec![(peer.id, 2)]);
    assert_eq!(fx.resolver.sent_requests().jobs_to_steal(&peer.id), Some(2));
    assert_eq!(fx.resolver.metrics().total_requested_jobs, 2);
}

#[test]
fn test_outstanding_request_is_not_repeated() {
    let fx = ResolverFixture::new(StealingConfig::default().with_active_jobs_threshold(2));
    let peer = busy_peer(5, 0);
    fx.join(peer.clone());

    fx.resolver.on_collision(&[], &[]);
    let outcome = fx.resolver.on_collision(&[], &[]);

    assert_eq!(outcome.requested, 0);
    assert_eq!(fx.messaging.steal_requests().len(), 1);
}

#[test]
fn test_outstanding_request_repeated_after_expiry() {
    let fx = ResolverFixture::new(
        StealingConfig::default()
            .with_active_jobs_threshold(2)
            .with_message_expire_time(Duration::from_millis(20)),
    );
    let peer = busy_peer(5, 0);
    fx.join(peer.clone());

    fx.resolver.on_collision(&[], &[]);
    std::thread::sleep(Duration::from_millis(40));
    let outcome = fx.resolver.on_collision(&[], &[]);

    assert_eq!(outcome.requested, 2);
    assert_eq!(fx.messaging.steal_requests().len(), 2);
}

#[test]
fn test_idle_spreads_over_peers_round_robin() {
    let fx = ResolverFixture::new(StealingConfig::default().with_active_jobs_threshold(4));
    let first = busy_peer(3, 0);
    let second = busy_peer(3, 0);
    fx.join(first.clone());
    fx.join(second.clone());

    let outcome = fx.resolver.on_collision(&[], &[]);

    assert_eq!(outcome.requested, 4);
    assert_eq!(
        fx.messaging.steal_requests(),
        vec![(first.id, 3), (second.id, 1)]
    );
}

#[test]
fn test_idle_skips_unconfigured_and_idle_peers() {
    let fx = ResolverFixture::new(StealingConfig::default().with_active_jobs_threshold(4));
    let unconfigured = GridNode::random()
        .with_metrics(grid_placement::topology::NodeMetricsSnapshot::with_jobs(0, 10));
    let quiet = busy_peer(2, 2);
    fx.join(unconfigured);
    fx.join(quiet);

    let outcome = fx.resolver.on_collision(&[], &[]);

    assert_eq!(outcome.requested, 0);
    assert!(fx.messaging.steal_requests().is_empty());
}

#[test]
fn test_idle_respects_attribute_filter() {
    let filter = AttributeFilter::new().require("zone", "a");
    let fx = ResolverFixture::new(
        StealingConfig::default()
            .with_active_jobs_threshold(4)
            .with_stealing_attributes(filter),
    );
    let other_zone = busy_peer(5, 0).with_attribute("zone", "b");
    let same_zone = busy_peer(5, 0).with_attribute("zone", "a");
    fx.join(other_zone);
    fx.join(same_zone.clone());

    fx.resolver.on_collision(&[], &[]);

    assert_eq!(fx.messaging.steal_requests(), vec![(same_zone.id, 4)]);
}

#[test]
fn test_full_node_does_not_ask() {
    let fx = ResolverFixture::new(StealingConfig::default().with_active_jobs_threshold(2));
    fx.join(busy_peer(5, 0));

    let session = Uuid::new_v4();
    let active = waiting_jobs(2, session);
    for job in &active {
        job.activate();
    }

    let outcome = fx.resolver.on_collision(&[], &active);
    assert_eq!(outcome.requested, 0);
}

#[test]
fn test_stealing_disabled_never_asks() {
    let fx = ResolverFixture::new(
        StealingConfig::default()
            .with_active_jobs_threshold(4)
            .with_stealing_enabled(false),
    );
    fx.join(busy_peer(5, 0));

    let outcome = fx.resolver.on_collision(&[], &[]);
    assert_eq!(outcome.requested, 0);
    assert!(fx.messaging.steal_requests().is_empty());
}

#[test]
fn test_failed_send_is_not_recorded() {
    let fx = ResolverFixture::new(StealingConfig::default().with_active_jobs_threshold(2));
    let peer = busy_peer(5, 0);
    fx.join(peer.clone());
    fx.messaging.set_failing(true);

    let outcome = fx.resolver.on_collision(&[], &[]);

    assert_eq!(outcome.requested, 0);
    assert_eq!(
        fx.resolver.sent_requests().jobs_to_steal(&peer.id).unwrap_or(0),
        0
    );

    // Transport back: the next pass asks again.
    fx.messaging.set_failing(false);
    let outcome = fx.resolver.on_collision(&[], &[]);
    assert_eq!(outcome.requested, 2);
}

#[test]
fn test_departed_peer_leaves_round_robin() {
    let fx = ResolverFixture::new(StealingConfig::default().with_active_jobs_threshold(4));
    let peer = busy_peer(5, 0);
    fx.join(peer.clone());

    fx.topology.remove(&peer.id);
    fx.resolver.on_discovery_event(&DiscoveryEvent::left(peer.clone()));

    let outcome = fx.resolver.on_collision(&[], &[]);
    assert_eq!(outcome.requested, 0);
    assert!(fx.resolver.sent_requests().jobs_to_steal(&peer.id).is_none());
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_passes_hand_each_job_away_once() {
    let fx = Arc::new(ResolverFixture::new(busy_config()));
    let thieves: Vec<GridNode> = (0..4).map(|_| GridNode::random()).collect();
    for thief in &thieves {
        fx.join(thief.clone());
        fx.resolver.on_steal_request(thief.id, StealRequest { delta: 10 });
    }
    assert_eq!(fx.resolver.steal_requests(), 40);

    let jobs = Arc::new(waiting_jobs(100, Uuid::new_v4()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let fx = fx.clone();
            let jobs = jobs.clone();
            std::thread::spawn(move || fx.resolver.on_collision(&jobs, &[]).rejected)
        })
        .collect();

    let rejected: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let cancelled = jobs
        .iter()
        .filter(|j| j.state() == JobState::Cancelled)
        .count();

    assert_eq!(rejected, 40);
    assert_eq!(cancelled, 40);
    assert_eq!(fx.resolver.steal_requests(), 0);
    assert_eq!(fx.resolver.received_requests().total(), 0);

    for thief in &thieves {
        let stolen = jobs.iter().filter(|j| j.thief() == Some(thief.id)).count();
        assert_eq!(stolen, 10);
    }
}
