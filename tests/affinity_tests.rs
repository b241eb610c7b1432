use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use grid_placement::balancer::{
    AffinityBalancer, AffinityHasher, AffinityRing, LoadBalancer, TaskEvent, DEFAULT_REPLICAS,
};
use grid_placement::config::AffinityConfig;
use grid_placement::error::PlacementError;
use grid_placement::scheduler::JobSpec;
use grid_placement::topology::node::ATTR_AFFINITY_REPLICAS;
use grid_placement::topology::{AttributeFilter, DiscoveryEvent, GridNode};

fn ring_node(replicas: u32) -> GridNode {
    GridNode::random().with_attribute(ATTR_AFFINITY_REPLICAS, replicas)
}

fn balancer_with(nodes: &[GridNode]) -> AffinityBalancer {
    let balancer = AffinityBalancer::from_config(AffinityConfig::default()).unwrap();
    for node in nodes {
        balancer.on_discovery_event(&DiscoveryEvent::joined(node.clone()));
    }
    balancer
}

fn keyed(key: &str) -> JobSpec {
    JobSpec::new().with_affinity_key(key)
}

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("key-{i}")).collect()
}

#[test]
fn test_key_is_stable_across_lookups() {
    let nodes = vec![ring_node(1000), ring_node(1000), ring_node(1000)];
    let balancer = balancer_with(&nodes);
    let session = Uuid::new_v4();

    let first = balancer.pick_node(session, &nodes, &keyed("customer-42")).unwrap();
    for _ in 0..100 {
        let again = balancer.pick_node(session, &nodes, &keyed("customer-42")).unwrap();
        assert_eq!(again.id, first.id);
    }
}

#[test]
fn test_mapping_is_deterministic_across_balancers() {
    let nodes = vec![ring_node(1000), ring_node(1000), ring_node(1000)];
    let one = balancer_with(&nodes);
    let reversed: Vec<GridNode> = nodes.iter().rev().cloned().collect();
    let two = balancer_with(&reversed);

    for key in keys(200) {
        let a = one.pick_node(Uuid::new_v4(), &nodes, &keyed(&key)).unwrap();
        let b = two.pick_node(Uuid::new_v4(), &nodes, &keyed(&key)).unwrap();
        assert_eq!(a.id, b.id, "key {key} mapped differently");
    }
}

#[test]
fn test_keys_spread_over_all_nodes() {
    let nodes = vec![ring_node(1000), ring_node(1000), ring_node(1000)];
    let balancer = balancer_with(&nodes);

    let owners: HashSet<_> = keys(300)
        .iter()
        .map(|k| balancer.pick_node(Uuid::new_v4(), &nodes, &keyed(k)).unwrap().id)
        .collect();
    assert_eq!(owners.len(), 3);
}

#[test]
fn test_removing_node_only_moves_its_keys() {
    let a = ring_node(1000);
    let b = ring_node(1000);
    let c = ring_node(1000);
    let all = vec![a.clone(), b.clone(), c.clone()];
    let balancer = balancer_with(&all);

    let before: Vec<_> = keys(300)
        .into_iter()
        .map(|k| {
            let owner = balancer.pick_node(Uuid::new_v4(), &all, &keyed(&k)).unwrap().id;
            (k, owner)
        })
        .collect();
    assert!(before.iter().any(|(_, owner)| *owner == b.id));

    balancer.on_discovery_event(&DiscoveryEvent::left(b.clone()));
    assert!(!balancer.ring().contains(&b.id));

    let remaining = vec![a.clone(), c.clone()];
    for (key, owner) in before {
        let now = balancer
            .pick_node(Uuid::new_v4(), &remaining, &keyed(&key))
            .unwrap()
            .id;
        if owner == b.id {
            assert!(now == a.id || now == c.id);
        } else {
            assert_eq!(now, owner, "key {key} moved although its node stayed");
        }
    }
}

#[test]
fn test_pick_restricted_to_session_candidates() {
    let nodes = vec![ring_node(1000), ring_node(1000), ring_node(1000)];
    let balancer = balancer_with(&nodes);

    for key in keys(50) {
        let owner = balancer.ring().lookup(key.as_bytes()).unwrap();
        let candidates: Vec<GridNode> = nodes.iter().filter(|n| n.id != owner).cloned().collect();
        let allowed: HashSet<_> = candidates.iter().map(|n| n.id).collect();

        let picked = balancer
            .pick_node(Uuid::new_v4(), &candidates, &keyed(&key))
            .unwrap();
        assert_ne!(picked.id, owner);
        assert_eq!(
            Some(picked.id),
            balancer.ring().get(key.as_bytes(), |id| allowed.contains(id))
        );
    }
}

#[test]
fn test_session_keeps_first_candidate_set_until_mapped() {
    let a = ring_node(1000);
    let b = ring_node(1000);
    let balancer = balancer_with(&[a.clone(), b.clone()]);
    let session = Uuid::new_v4();

    // Find a key owned by `b`.
    let key = keys(100)
        .into_iter()
        .find(|k| balancer.ring().lookup(k.as_bytes()) == Some(b.id))
        .unwrap();

    // Session starts with only `a`; its cached set excludes `b`.
    let picked = balancer.pick_node(session, &[a.clone()], &keyed(&key)).unwrap();
    assert_eq!(picked.id, a.id);
    let picked = balancer
        .pick_node(session, &[a.clone(), b.clone()], &keyed(&key))
        .unwrap();
    assert_eq!(picked.id, a.id);

    // Mapped sessions see the candidates they are given.
    balancer.on_task_event(&TaskEvent::JobMapped(session));
    let picked = balancer
        .pick_node(session, &[a.clone(), b.clone()], &keyed(&key))
        .unwrap();
    assert_eq!(picked.id, b.id);
}

#[test]
fn test_job_without_key_picks_a_candidate() {
    let nodes = vec![ring_node(1000), ring_node(1000)];
    let balancer = balancer_with(&nodes);
    let ids: HashSet<_> = nodes.iter().map(|n| n.id).collect();

    for _ in 0..20 {
        let picked = balancer
            .pick_node(Uuid::new_v4(), &nodes, &JobSpec::new())
            .unwrap();
        assert!(ids.contains(&picked.id));
    }
}

#[test]
fn test_candidates_off_ring_fall_back_to_random() {
    let on_ring = ring_node(1000);
    let balancer = balancer_with(&[on_ring]);
    let stranger = GridNode::random();

    let picked = balancer
        .pick_node(Uuid::new_v4(), &[stranger.clone()], &keyed("anything"))
        .unwrap();
    assert_eq!(picked.id, stranger.id);
}

#[test]
fn test_empty_candidates_is_an_error() {
    let balancer = balancer_with(&[ring_node(10)]);
    assert!(matches!(
        balancer.pick_node(Uuid::new_v4(), &[], &keyed("k")),
        Err(PlacementError::EmptyCandidates(_))
    ));
}

#[test]
fn test_missing_replicas_attribute_uses_default() {
    let node = GridNode::random();
    let balancer = balancer_with(&[node.clone()]);

    let positions = balancer.ring().positions_of(&node.id);
    assert!(positions > 0 && positions <= DEFAULT_REPLICAS as usize);
}

#[test]
fn test_node_filter_keeps_nodes_off_ring() {
    let config = AffinityConfig {
        node_filter: AttributeFilter::new().require("role", "worker"),
        ..AffinityConfig::default()
    };
    let balancer = AffinityBalancer::from_config(config).unwrap();
    let worker = ring_node(100).with_attribute("role", "worker");
    let client = ring_node(100).with_attribute("role", "client");

    balancer.on_discovery_event(&DiscoveryEvent::joined(worker.clone()));
    balancer.on_discovery_event(&DiscoveryEvent::joined(client.clone()));

    assert!(balancer.ring().contains(&worker.id));
    assert!(!balancer.ring().contains(&client.id));
    assert_eq!(balancer.ring().node_count(), 1);
}

#[test]
fn test_zero_replicas_config_is_rejected() {
    let config = AffinityConfig::default().with_virtual_node_count(0);
    assert!(matches!(
        AffinityBalancer::from_config(config),
        Err(PlacementError::InvalidConfig(_))
    ));
}

#[test]
fn test_node_attributes_publish_replica_count() {
    let attrs =
        AffinityBalancer::node_attributes(&AffinityConfig::default().with_virtual_node_count(750));
    assert_eq!(attrs[ATTR_AFFINITY_REPLICAS].as_i64(), Some(750));
}

#[test]
fn test_seed_changes_positions() {
    let node = Uuid::new_v4();
    let plain = AffinityRing::with_md5("");
    let seeded = AffinityRing::with_md5("tenant-a");
    plain.add_node(node, 200);
    seeded.add_node(node, 200);

    // Same node, same key hash, different positions.
    assert_eq!(plain.key_hash(b"k"), seeded.key_hash(b"k"));
    let other = Uuid::new_v4();
    plain.add_node(other, 200);
    seeded.add_node(other, 200);
    let differs = keys(200)
        .iter()
        .any(|k| plain.lookup(k.as_bytes()) != seeded.lookup(k.as_bytes()));
    assert!(differs);
}

struct NoDigest;

impl AffinityHasher for NoDigest {
    fn digest(&self, _bytes: &[u8]) -> Option<u32> {
        None
    }
}

#[test]
fn test_unavailable_digest_still_maps_consistently() {
    let balancer =
        AffinityBalancer::new(AffinityConfig::default(), Arc::new(NoDigest)).unwrap();
    let nodes = vec![ring_node(500), ring_node(500)];
    for node in &nodes {
        balancer.on_discovery_event(&DiscoveryEvent::joined(node.clone()));
    }

    let first = balancer.pick_node(Uuid::new_v4(), &nodes, &keyed("k")).unwrap();
    for _ in 0..10 {
        let again = balancer.pick_node(Uuid::new_v4(), &nodes, &keyed("k")).unwrap();
        assert_eq!(again.id, first.id);
    }
}

#[test]
fn test_metrics_update_does_not_touch_ring() {
    let node = ring_node(100);
    let balancer = balancer_with(&[node.clone()]);
    let before = balancer.ring().len();

    balancer.on_discovery_event(&DiscoveryEvent::metrics_updated(node.clone()));
    assert_eq!(balancer.ring().len(), before);
    assert_eq!(balancer.name(), "affinity");
}
