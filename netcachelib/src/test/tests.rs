use std::error::Error;
use serde_json::json;
use crate::cache::{CacheStore, GenericCache};
use crate::config::Mode;
use crate::content::ContentRequest;
use crate::simulator::{NetworkSimulator, Phase, PersistenceStatus, RoutingStrategy, SimulationMetrics};
use crate::test::fixtures::{client, line_network, options, replaying, trace, tree_network};
use crate::Error as SimError;

fn contents(simulator: &NetworkSimulator, router: &str) -> Vec<u64> {
    let handle = simulator.topology().handle(router).unwrap();
    simulator.topology().cache(handle).unwrap().contents()
}

fn warmed(kind: &str, mode: Mode) -> Result<NetworkSimulator, Box<dyn Error>> {
    let mut simulator = NetworkSimulator::new(&tree_network(kind), options(mode))?;
    let capacities = simulator.topology().default_capacities();
    simulator.reconfig(&capacities, 0)?;
    Ok(simulator)
}

#[test]
fn line_network_warm_up_follows_lru() -> Result<(), Box<dyn Error>> {
    // At capacity 2, inserting 3 evicts 1, so the final request for 1 misses
    let cases = [(json!([1, 2, 3, 1]), vec![3, 1], 0), (json!([1, 2, 1, 3]), vec![1, 3], 1)];
    for (requests, expected, hits) in cases {
        let data = trace(json!({ "Cache1": { "Interval0": requests.clone() } }));
        let mut simulator = replaying(&line_network("LRU", 2.0), data, options(Mode::NoColor));
        let report = simulator.reconfig(&[2.0], 0)?;
        println!("warmed {requests}: {report:?}");
        assert_eq!(contents(&simulator, "r1"), expected);
        assert_eq!(report.requests, 4);
        assert_eq!(report.hits, hits);
        assert_eq!(report.misses, 4 - hits);
        assert!(report.is_complete());
        assert_eq!(report.persistence, PersistenceStatus::Skipped);
        assert_eq!(simulator.phase(), Phase::Ready);
    }
    Ok(())
}

#[test]
fn warm_up_is_deterministic() -> Result<(), Box<dyn Error>> {
    for kind in ["LRU", "LFU", "FIFO", "Hybrid"] {
        let first = warmed(kind, Mode::NoColor)?;
        let second = warmed(kind, Mode::NoColor)?;
        assert_eq!(first.snapshot(), second.snapshot(), "{kind} caches differ between instances");
        assert_eq!(first.metrics(), second.metrics());
    }
    Ok(())
}

#[test]
fn reconfig_discards_the_previous_generation() -> Result<(), Box<dyn Error>> {
    let mut simulator = warmed("LRU", Mode::NoColor)?;
    let baseline = simulator.snapshot();
    simulator.reconfig(&[2.0, 1.0, 1.0, 1.0], 1)?;
    let small = simulator.snapshot();
    assert_eq!(small.run_index, 1);
    assert!(small.caches.values().all(|c| c.size() <= c.capacity()));
    assert_eq!(small.caches["core"].capacity(), 2);
    // Same sizes and seed as the first run, so the same caches come back
    let capacities = simulator.topology().default_capacities();
    simulator.reconfig(&capacities, 0)?;
    assert_eq!(simulator.snapshot(), baseline);
    Ok(())
}

#[test]
fn warm_up_fills_the_caches_on_client_paths() -> Result<(), Box<dyn Error>> {
    let simulator = warmed("LRU", Mode::NoColor)?;
    let metrics = simulator.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    assert_eq!(metrics.phase, Phase::Ready);
    assert_eq!(metrics.requests, 4 * 300);
    assert_eq!(metrics.hits + metrics.origin_fetches, metrics.requests);
    assert!(metrics.hits > 0);
    for cache in &metrics.caches {
        assert_eq!(cache.size, cache.capacity, "{} should be full after warm-up", cache.name);
        assert!(cache.hits + cache.misses > 0);
    }
    Ok(())
}

#[test]
fn no_cache_mode_leaves_caches_empty() -> Result<(), Box<dyn Error>> {
    let mut simulator = warmed("LRU", Mode::NoCache)?;
    assert_eq!(simulator.phase(), Phase::Ready);
    assert!(simulator.topology().caches().values().all(|c| c.size() == 0));
    let outcome = simulator.serve("client1", ContentRequest { id: 0, size: 1 }, RoutingStrategy::ShortestPath)?;
    assert!(!outcome.is_hit());
    let again = simulator.serve("client1", ContentRequest { id: 0, size: 1 }, RoutingStrategy::ColorAffinity)?;
    assert!(!again.is_hit());
    assert_eq!(simulator.metrics().origin_fetches, 2);
    assert!(simulator.topology().caches().values().all(|c| c.size() == 0));
    Ok(())
}

#[test]
fn tag_color_only_colors() -> Result<(), Box<dyn Error>> {
    let mut opts = options(Mode::TagColor);
    opts.colors = Some(vec![1, 2]);
    let mut simulator = NetworkSimulator::new(&tree_network("Hybrid"), opts)?;
    let capacities = simulator.topology().default_capacities();
    let report = simulator.reconfig(&capacities, 0)?;
    assert_eq!(report.requests, 0);
    assert_eq!(report.persistence, PersistenceStatus::Skipped);
    assert_eq!(simulator.phase(), Phase::Ready);
    let coloring = simulator.coloring().unwrap();
    for (handle, color) in &coloring.server_colors {
        let cache = simulator.topology().cache(*handle).unwrap().as_hybrid().unwrap();
        assert_eq!(cache.color(), Some(*color));
        assert_eq!(cache.size(), 0);
    }
    assert!(simulator.metrics().caches.iter().all(|c| c.color.is_some()));
    Ok(())
}

#[test]
fn colored_mode_publishes_the_nearest_color_table() -> Result<(), Box<dyn Error>> {
    let mut opts = options(Mode::Colored("hybrid".to_string()));
    opts.colors = Some(vec![1, 2]);
    let mut simulator = NetworkSimulator::new(&tree_network("Hybrid"), opts)?;
    let capacities = simulator.topology().default_capacities();
    let report = simulator.reconfig(&capacities, 0)?;
    assert_eq!(report.mode, Mode::Colored("hybrid".to_string()));
    let table = simulator.nearest_color_table().unwrap();
    for client in ["client1", "client2", "client3", "client4"] {
        assert!(table.get(client, 1).is_some() && table.get(client, 2).is_some());
    }
    Ok(())
}

#[test]
fn color_affinity_serves_from_the_nearest_colored_cache() -> Result<(), Box<dyn Error>> {
    let mut opts = options(Mode::Colored("hybrid".to_string()));
    opts.colors = Some(vec![1, 2]);
    let mut simulator = NetworkSimulator::new(&tree_network("Hybrid"), opts)?;
    let capacities = simulator.topology().default_capacities();
    simulator.reconfig(&capacities, 0)?;

    // Content 2 has color 1, carried by core and e2
    let request = ContentRequest { id: 2, size: 1 };
    let core = simulator.topology().handle("core").unwrap();
    let e2 = simulator.topology().handle("e2").unwrap();
    let table = simulator.nearest_color_table().unwrap();
    assert_eq!(table.get("client4", 1).unwrap().server, core);
    assert_eq!(table.get("client1", 1).unwrap().server, e2);

    let first = simulator.serve("client4", request, RoutingStrategy::ColorAffinity)?;
    assert!(!first.is_hit());
    let second = simulator.serve("client4", request, RoutingStrategy::ColorAffinity)?;
    assert_eq!(second.served_by, Some(core));

    // e2 misses, so client1 falls back to its shortest path, which crosses core
    let fallback = simulator.serve("client1", request, RoutingStrategy::ColorAffinity)?;
    assert_eq!(fallback.served_by, Some(core));
    let local = simulator.serve("client1", request, RoutingStrategy::ColorAffinity)?;
    assert_eq!(local.served_by, Some(e2));

    let metrics = simulator.metrics();
    assert_eq!((metrics.requests, metrics.hits, metrics.origin_fetches), (4, 3, 1));
    assert_eq!(cache_counts(&metrics, "core"), (2, 1));
    assert_eq!(cache_counts(&metrics, "e1"), (0, 1));
    assert_eq!(cache_counts(&metrics, "e2"), (1, 1));
    assert_eq!(cache_counts(&metrics, "e3"), (0, 1));
    Ok(())
}

fn cache_counts(metrics: &SimulationMetrics, name: &str) -> (u64, u64) {
    let cache = metrics.caches.iter().find(|c| c.name == name).unwrap();
    (cache.hits, cache.misses)
}

#[test]
fn color_affinity_tries_an_on_path_colored_cache_once() -> Result<(), Box<dyn Error>> {
    let mut opts = options(Mode::Colored("lfu".to_string()));
    opts.colors = Some(vec![1, 2]);
    let mut simulator = NetworkSimulator::new(&tree_network("LFU"), opts)?;
    let capacities = simulator.topology().default_capacities();
    simulator.reconfig(&capacities, 0)?;

    // core carries color 1 and also sits on client4's shortest path
    let core = simulator.topology().handle("core").unwrap();
    assert_eq!(simulator.nearest_color_table().unwrap().get("client4", 1).unwrap().server, core);
    let outcome = simulator.serve("client4", ContentRequest { id: 2, size: 1 }, RoutingStrategy::ColorAffinity)?;
    assert!(!outcome.is_hit());

    let metrics = simulator.metrics();
    assert_eq!(metrics.requests, 1);
    assert_eq!(cache_counts(&metrics, "core"), (0, 1));
    assert_eq!(cache_counts(&metrics, "e3"), (0, 1));
    match simulator.topology().cache(core).unwrap() {
        GenericCache::LeastFrequentlyUsed(cache) => assert_eq!(cache.policy().usage_count(2), Some(1)),
        other => panic!("core should hold an LFU cache, found {:?}", other.kind()),
    }
    Ok(())
}

#[test]
fn shortest_path_serving_hits_the_first_cache() -> Result<(), Box<dyn Error>> {
    let data = trace(json!({ "Cache1": { "Interval0": [5, 6] } }));
    let mut simulator = replaying(&line_network("FIFO", 4.0), data, options(Mode::NoColor));
    simulator.reconfig(&[4.0], 0)?;
    let outcome = simulator.serve("client1", ContentRequest { id: 6, size: 1 }, RoutingStrategy::ShortestPath)?;
    let r1 = simulator.topology().handle("r1").unwrap();
    assert_eq!(outcome.served_by, Some(r1));
    assert!((outcome.cost - 0.01).abs() < 1e-12);
    let miss = simulator.serve("client1", ContentRequest { id: 7, size: 1 }, RoutingStrategy::ShortestPath)?;
    assert!(!miss.is_hit());
    assert!((miss.cost - 0.11).abs() < 1e-12);
    assert_eq!(contents(&simulator, "r1"), vec![5, 6, 7]);
    Ok(())
}

#[test]
fn oversized_content_is_served_but_not_cached() -> Result<(), Box<dyn Error>> {
    let data = trace(json!({ "Cache1": { "Interval0": [{ "id": 1, "size": 1 }, { "id": 2, "size": 50 }] } }));
    let topology = crate::topology::Topology::build(&line_network("LRU", 10.0))?;
    let popularity = crate::content::Popularity::trace(data)?;
    let generator = crate::content::ContentGenerator::new(popularity, None, None, 0)?;
    let mut simulator = NetworkSimulator::with_parts(topology, generator, options(Mode::NoColor))?;
    let report = simulator.reconfig(&[10.0], 0)?;
    assert_eq!(report.misses, 2);
    assert_eq!(contents(&simulator, "r1"), vec![1]);
    Ok(())
}

#[test]
fn unreachable_clients_are_skipped() -> Result<(), Box<dyn Error>> {
    let mut config = tree_network("LRU");
    config.clients.push(serde_json::from_value(client("client5"))?);
    let mut simulator = NetworkSimulator::new(&config, options(Mode::NoColor))?;
    let capacities = simulator.topology().default_capacities();
    let report = simulator.reconfig(&capacities, 0)?;
    assert_eq!(report.unreachable, vec!["client5".to_string()]);
    assert!(!report.is_complete());
    assert_eq!(report.clients_warmed, 4);
    assert_eq!(simulator.phase(), Phase::Ready);
    match simulator.serve("client5", ContentRequest { id: 0, size: 1 }, RoutingStrategy::ShortestPath) {
        Err(SimError::UnreachableNode { client, .. }) => assert_eq!(client, "client5"),
        other => panic!("expected an unreachable node error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn cancelled_warm_up_discards_the_generation() -> Result<(), Box<dyn Error>> {
    let mut simulator = NetworkSimulator::new(&tree_network("LRU"), options(Mode::NoColor))?;
    let capacities = simulator.topology().default_capacities();
    let token = simulator.cancel_token();
    token.cancel();
    assert!(matches!(simulator.reconfig(&capacities, 0), Err(SimError::Cancelled)));
    assert_eq!(simulator.phase(), Phase::Built);
    assert!(simulator.topology().caches().is_empty());
    assert!(matches!(simulator.warm_up(), Err(SimError::Configuration(_))));

    // The token is consumed by the cancelled run
    assert!(!token.is_cancelled());
    let report = simulator.reconfig(&capacities, 0)?;
    assert_eq!(report.requests, 4 * 300);
    assert_eq!(simulator.snapshot(), warmed("LRU", Mode::NoColor)?.snapshot());
    Ok(())
}

#[test]
fn cancel_raised_before_a_non_routing_warm_up_is_consumed() -> Result<(), Box<dyn Error>> {
    for mode in [Mode::NoCache, Mode::TagColor] {
        let mut simulator = NetworkSimulator::new(&tree_network("LRU"), options(mode))?;
        let capacities = simulator.topology().default_capacities();
        let token = simulator.cancel_token();
        token.cancel();
        assert!(matches!(simulator.reconfig(&capacities, 0), Err(SimError::Cancelled)));
        assert_eq!(simulator.phase(), Phase::Built);
        assert!(!token.is_cancelled());
        simulator.reconfig(&capacities, 0)?;
        assert_eq!(simulator.phase(), Phase::Ready);
    }
    Ok(())
}

#[test]
fn serving_needs_a_ready_instance_and_a_known_client() -> Result<(), Box<dyn Error>> {
    let mut simulator = NetworkSimulator::new(&tree_network("LRU"), options(Mode::NoColor))?;
    let request = ContentRequest { id: 0, size: 1 };
    assert!(matches!(simulator.serve("client1", request, RoutingStrategy::ShortestPath), Err(SimError::Configuration(_))));
    let capacities = simulator.topology().default_capacities();
    simulator.reconfig(&capacities, 0)?;
    assert!(matches!(simulator.serve("core", request, RoutingStrategy::ShortestPath), Err(SimError::Configuration(_))));
    assert!(matches!(simulator.serve("client9", request, RoutingStrategy::ShortestPath), Err(SimError::Configuration(_))));
    simulator.serve("client1", request, RoutingStrategy::ShortestPath)?;
    assert!(simulator.serve("client1", request, RoutingStrategy::ShortestPath)?.is_hit());
    println!("served in {:?}", simulator.get_execution_time());
    Ok(())
}

#[test]
fn empty_color_list_is_rejected_up_front() {
    let mut opts = options(Mode::TagColor);
    opts.colors = Some(Vec::new());
    assert!(matches!(NetworkSimulator::new(&tree_network("Hybrid"), opts), Err(SimError::Configuration(_))));
}
