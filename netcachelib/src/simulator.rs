use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use crate::cache::{CacheStore, GenericCache};
use crate::coloring::{colorize, content_color, ColorId, ColoringInfo, NearestColorTable};
use crate::config::{CacheTypeConfig, Mode, NetworkConfig, SimulationOptions};
use crate::content::{ContentGenerator, ContentRequest, WARM_UP_INTERVAL};
use crate::error::{Error, Result};
use crate::persist::{save_nearest_color_table, save_snapshot, CacheSnapshot};
use crate::topology::{NodeHandle, Path, Topology};

/// Lifecycle of a simulation instance
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    /// Nodes and links exist, no cache generation is live
    Built,
    /// Caches carry their colors
    Colored,
    /// Warm-up traffic has been routed
    WarmedUp,
    /// Ready for measurement
    Ready,
}

/// How a live request picks the caches it tries
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum RoutingStrategy {
    /// Only the caches on the shortest path to the origin
    ShortestPath,
    /// The nearest cache of the content's color first, then the shortest path to the origin
    ColorAffinity,
}

/// Shared flag used to interrupt a warm-up from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Where a routed request was answered
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutcome {
    /// The cache which hit, `None` when the origin served the request
    pub served_by: Option<NodeHandle>,
    /// Path weight travelled to the serving node
    pub cost: f64,
}

impl RouteOutcome {
    pub fn is_hit(&self) -> bool {
        self.served_by.is_some()
    }
}

/// Whether the warm-up's artifacts reached stable storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PersistenceStatus {
    /// No snapshot directory was configured, or the mode persists nothing
    Skipped,
    Written(PathBuf),
    /// The in-memory result is still valid
    Failed(String),
}

/// Summary of one warm-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmUpReport {
    pub run_index: usize,
    pub mode: Mode,
    pub clients_warmed: usize,
    /// Clients with no path to the origin, skipped
    pub unreachable: Vec<String>,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub persistence: PersistenceStatus,
}

impl WarmUpReport {
    fn new(run_index: usize, mode: Mode) -> Self {
        Self {
            run_index,
            mode,
            clients_warmed: 0,
            unreachable: Vec::new(),
            requests: 0,
            hits: 0,
            misses: 0,
            persistence: PersistenceStatus::Skipped,
        }
    }

    /// False when some clients could not be warmed
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }
}

/// The result for an individual cache. Can be serialised to the output format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheResult {
    pub name: String,
    pub policy: CacheTypeConfig,
    pub hits: u64,
    pub misses: u64,
    pub size: u64,
    pub capacity: u64,
    pub color: Option<ColorId>,
}

/// The metrics read surface, available once the instance is Ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationMetrics {
    pub run_index: usize,
    pub phase: Phase,
    pub requests: u64,
    pub hits: u64,
    pub origin_fetches: u64,
    pub hit_rate: f64,
    pub caches: Vec<CacheResult>,
}

#[derive(Debug, Copy, Clone, Default)]
struct Counter {
    hits: u64,
    misses: u64,
}

/// One simulated network: the topology with its caches, the request model, and the warm-up
/// state machine
///
/// Every [`NetworkSimulator::reconfig`] discards the previous cache generation and re-runs the
/// warm-up from scratch, so the same configuration and seed always produce the same caches
#[derive(Debug)]
pub struct NetworkSimulator {
    topology: Topology,
    generator: ContentGenerator,
    options: SimulationOptions,
    phase: Phase,
    run_index: usize,
    coloring: Option<ColoringInfo>,
    routing_table: HashMap<NodeHandle, Option<Path>>,
    counters: BTreeMap<NodeHandle, Counter>,
    requests: u64,
    hits: u64,
    origin_fetches: u64,
    cancel: CancelToken,
    simulation_time: Duration,
}

impl NetworkSimulator {
    /// Builds the topology and the content model. Configuration errors surface here, before any
    /// simulation starts
    pub fn new(config: &NetworkConfig, options: SimulationOptions) -> Result<Self> {
        let topology = Topology::build(config)?;
        let generator = ContentGenerator::from_config(config, options.seed)?;
        Self::with_parts(topology, generator, options)
    }

    /// Assembles an instance from an already built topology and content model
    pub fn with_parts(topology: Topology, generator: ContentGenerator, options: SimulationOptions) -> Result<Self> {
        if let Some(colors) = &options.colors {
            if colors.is_empty() {
                return Err(Error::config("the color list must not be empty"));
            }
        }
        Ok(Self {
            topology,
            generator,
            options,
            phase: Phase::Built,
            run_index: 0,
            coloring: None,
            routing_table: HashMap::new(),
            counters: BTreeMap::new(),
            requests: 0,
            hits: 0,
            origin_fetches: 0,
            cancel: CancelToken::default(),
            simulation_time: Duration::new(0, 0),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn generator(&self) -> &ContentGenerator {
        &self.generator
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mode(&self) -> &Mode {
        &self.options.mode
    }

    pub fn coloring(&self) -> Option<&ColoringInfo> {
        self.coloring.as_ref()
    }

    pub fn nearest_color_table(&self) -> Option<&NearestColorTable> {
        self.coloring.as_ref().map(|c| &c.nearest)
    }

    /// A handle which interrupts the next or running warm-up
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Gets the wall-clock time spent routing requests
    pub fn get_execution_time(&self) -> &Duration {
        &self.simulation_time
    }

    /// Allocates a fresh cache generation with the given sizes (in cache router declaration order)
    /// and warms it up. On return the instance is Ready
    pub fn reconfig(&mut self, capacities: &[f64], run_index: usize) -> Result<WarmUpReport> {
        info!(run_index, mode = %self.options.mode, "reconfiguring");
        self.discard_generation();
        self.topology.allocate_caches(capacities)?;
        self.run_index = run_index;
        self.generator.reseed(self.options.seed);
        self.warm_up()
    }

    /// Runs the mode's warm-up on the current cache generation
    pub fn warm_up(&mut self) -> Result<WarmUpReport> {
        if self.topology.caches().len() != self.topology.cache_routers().len() {
            return Err(Error::config("warm-up needs a cache generation, call reconfig first"));
        }
        // A cancel raised before this warm-up is consumed here, whatever the mode
        if self.cancel.is_cancelled() {
            self.cancel.reset();
            self.discard_generation();
            return Err(Error::Cancelled);
        }
        let start = Instant::now();
        let result = match self.options.mode.clone() {
            Mode::NoCache => Ok(WarmUpReport::new(self.run_index, Mode::NoCache)),
            Mode::NoColor => self.warm_up_shortest_path(),
            mode @ Mode::TagColor => self.apply_coloring().map(|_| WarmUpReport::new(self.run_index, mode)),
            mode @ Mode::Colored(_) => self.apply_coloring().map(|_| {
                let mut report = WarmUpReport::new(self.run_index, mode);
                report.persistence = self.persist_nearest_color_table();
                report
            }),
        };
        self.simulation_time += start.elapsed();
        match result {
            Ok(report) => {
                self.phase = Phase::Ready;
                info!(
                    run_index = self.run_index,
                    requests = report.requests,
                    hits = report.hits,
                    unreachable = report.unreachable.len(),
                    "warm-up finished"
                );
                Ok(report)
            }
            Err(e) => {
                // A partially warmed generation is never valid
                self.discard_generation();
                Err(e)
            }
        }
    }

    fn warm_up_shortest_path(&mut self) -> Result<WarmUpReport> {
        let mut report = WarmUpReport::new(self.run_index, Mode::NoColor);
        let clients = self.topology.client_ids().to_vec();
        for client in clients {
            let client_id = self.topology.id(client).to_string();
            if !self.is_routable(client) {
                warn!(client = %client_id, "no path to origin, skipping warm-up");
                report.unreachable.push(client_id);
                continue;
            }
            let batch: Vec<ContentRequest> = if self.generator.is_trace() {
                self.generator.replay(&client_id, WARM_UP_INTERVAL)?
            } else {
                self.generator
                    .generate_for(&client_id, self.options.warm_up_requests)?
                    .collect::<Result<_>>()?
            };
            for request in batch {
                if self.cancel.is_cancelled() {
                    self.cancel.reset();
                    return Err(Error::Cancelled);
                }
                let outcome = self.route_shortest_path(client, request)?;
                report.requests += 1;
                if outcome.is_hit() {
                    report.hits += 1;
                } else {
                    report.misses += 1;
                }
            }
            report.clients_warmed += 1;
            debug!(client = %client_id, requests = report.requests, hits = report.hits, "client warmed");
        }
        self.phase = Phase::WarmedUp;
        if let Some(dir) = self.options.snapshot_dir.clone() {
            report.persistence = match save_snapshot(&dir, &self.snapshot()) {
                Ok(path) => PersistenceStatus::Written(path),
                Err(e) => {
                    warn!("{e}");
                    PersistenceStatus::Failed(e.to_string())
                }
            };
        }
        Ok(report)
    }

    fn apply_coloring(&mut self) -> Result<()> {
        let coloring = colorize(&self.topology, self.options.colors.as_deref())?;
        for (server, color) in &coloring.server_colors {
            if let Some(cache) = self.topology.cache_mut(*server) {
                cache.set_server_color(*color, &coloring.palette);
            }
        }
        self.coloring = Some(coloring);
        self.phase = Phase::Colored;
        Ok(())
    }

    fn persist_nearest_color_table(&self) -> PersistenceStatus {
        match (&self.options.snapshot_dir, &self.coloring) {
            (Some(dir), Some(coloring)) => match save_nearest_color_table(dir, &coloring.nearest) {
                Ok(path) => PersistenceStatus::Written(path),
                Err(e) => {
                    warn!("{e}");
                    PersistenceStatus::Failed(e.to_string())
                }
            },
            _ => PersistenceStatus::Skipped,
        }
    }

    /// Drops the live cache generation and every per-generation table
    fn discard_generation(&mut self) {
        self.topology.clear_caches();
        self.coloring = None;
        self.routing_table.clear();
        self.counters.clear();
        self.requests = 0;
        self.hits = 0;
        self.origin_fetches = 0;
        self.phase = Phase::Built;
    }

    fn is_routable(&mut self, client: NodeHandle) -> bool {
        memoised_path(&mut self.routing_table, &self.topology, client).is_some()
    }

    /// Tries every cache on the shortest path to the origin in order. On a hit, copies are left at
    /// every cache between the client and the hit; on a miss, at every cache on the path
    fn route_shortest_path(&mut self, client: NodeHandle, request: ContentRequest) -> Result<RouteOutcome> {
        self.walk_shortest_path(client, request, None)
    }

    /// The shortest-path walk. `skip` names a cache already tried by the caller, which is neither
    /// looked up nor filled again
    fn walk_shortest_path(
        &mut self,
        client: NodeHandle,
        request: ContentRequest,
        skip: Option<NodeHandle>,
    ) -> Result<RouteOutcome> {
        let Some(path) = memoised_path(&mut self.routing_table, &self.topology, client) else {
            return Err(unreachable(&self.topology, client));
        };
        self.requests += 1;
        let mut outcome = RouteOutcome { served_by: None, cost: path.cost };
        let mut passed = Vec::new();
        let mut cost = 0.0;
        for (i, hop) in path.intermediate().iter().enumerate() {
            cost += link_weight(&self.topology, path.nodes[i], *hop);
            if skip == Some(*hop) {
                continue;
            }
            let Some(cache) = self.topology.cache_mut(*hop) else {
                continue;
            };
            let hit = cache.lookup(request.id);
            let counter = self.counters.entry(*hop).or_default();
            if hit {
                counter.hits += 1;
                outcome = RouteOutcome { served_by: Some(*hop), cost };
                break;
            }
            counter.misses += 1;
            passed.push(*hop);
        }
        if outcome.is_hit() {
            self.hits += 1;
        } else {
            self.origin_fetches += 1;
        }
        for hop in passed {
            self.store(hop, request)?;
        }
        Ok(outcome)
    }

    /// Inserts into one cache. Oversized content stays a miss
    fn store(&mut self, server: NodeHandle, request: ContentRequest) -> Result<()> {
        let Some(cache) = self.topology.cache_mut(server) else {
            return Ok(());
        };
        match cache.insert(request.id, request.size) {
            Ok(_) => Ok(()),
            Err(e @ Error::CapacityExceeded { .. }) => {
                debug!(server = self.topology.id(server), "{e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Serves one live request from a client. In `no-cache` mode every request goes to the origin
    pub fn serve(&mut self, client_id: &str, request: ContentRequest, strategy: RoutingStrategy) -> Result<RouteOutcome> {
        let client = self
            .topology
            .handle(client_id)
            .filter(|h| self.topology.is_client(*h))
            .ok_or_else(|| Error::config(format!("unknown client {client_id}")))?;
        if self.phase != Phase::Ready {
            return Err(Error::config("the simulator must be Ready to serve requests, call reconfig first"));
        }
        let start = Instant::now();
        let bypass_caches = self.options.mode == Mode::NoCache;
        let outcome = match (bypass_caches, strategy) {
            (true, _) => match memoised_path(&mut self.routing_table, &self.topology, client) {
                Some(path) => {
                    let cost = path.cost;
                    self.requests += 1;
                    self.origin_fetches += 1;
                    Ok(RouteOutcome { served_by: None, cost })
                }
                None => Err(unreachable(&self.topology, client)),
            },
            (false, RoutingStrategy::ShortestPath) => self.route_shortest_path(client, request),
            (false, RoutingStrategy::ColorAffinity) => self.route_color_affinity(client, request),
        };
        self.simulation_time += start.elapsed();
        outcome
    }

    fn route_color_affinity(&mut self, client: NodeHandle, request: ContentRequest) -> Result<RouteOutcome> {
        let nearest = self.coloring.as_ref().and_then(|coloring| {
            let color = content_color(request.id, &coloring.palette)?;
            coloring.nearest.get(self.topology.id(client), color).cloned()
        });
        let Some(nearest) = nearest else {
            return self.route_shortest_path(client, request);
        };
        let hit = self.topology.cache_mut(nearest.server).map_or(false, |c| c.lookup(request.id));
        let counter = self.counters.entry(nearest.server).or_default();
        if hit {
            counter.hits += 1;
            self.requests += 1;
            self.hits += 1;
            return Ok(RouteOutcome { served_by: Some(nearest.server), cost: nearest.cost });
        }
        counter.misses += 1;
        let outcome = self.walk_shortest_path(client, request, Some(nearest.server))?;
        // The colored cache keeps a copy so the next request for this color is served locally
        self.store(nearest.server, request)?;
        Ok(outcome)
    }

    /// A copy of the live cache generation, keyed by router id
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            run_index: self.run_index,
            caches: self
                .topology
                .caches()
                .iter()
                .map(|(h, c)| (self.topology.id(*h).to_string(), c.clone()))
                .collect(),
        }
    }

    /// Installs a previously saved generation in place of the live one. The snapshot must cover
    /// exactly the cache routers of this topology
    pub fn restore(&mut self, snapshot: CacheSnapshot) -> Result<()> {
        let mut caches: BTreeMap<NodeHandle, GenericCache> = BTreeMap::new();
        for (id, cache) in snapshot.caches {
            let handle = self
                .topology
                .handle(&id)
                .filter(|h| self.topology.cache_routers().contains(h))
                .ok_or_else(|| Error::config(format!("snapshot holds a cache for {id}, which is not a cache router")))?;
            caches.insert(handle, cache);
        }
        if caches.len() != self.topology.cache_routers().len() {
            return Err(Error::config(format!(
                "snapshot covers {} of {} cache routers",
                caches.len(),
                self.topology.cache_routers().len()
            )));
        }
        self.discard_generation();
        self.topology.replace_caches(caches);
        self.run_index = snapshot.run_index;
        self.phase = Phase::Ready;
        Ok(())
    }

    pub fn metrics(&self) -> SimulationMetrics {
        let caches = self
            .topology
            .caches()
            .iter()
            .map(|(handle, cache)| {
                let counter = self.counters.get(handle).copied().unwrap_or_default();
                CacheResult {
                    name: self.topology.id(*handle).to_string(),
                    policy: cache.kind(),
                    hits: counter.hits,
                    misses: counter.misses,
                    size: cache.size(),
                    capacity: cache.capacity(),
                    color: cache.as_hybrid().and_then(|h| h.color()).or_else(|| {
                        self.coloring.as_ref().and_then(|c| c.server_colors.get(handle).copied())
                    }),
                }
            })
            .collect();
        SimulationMetrics {
            run_index: self.run_index,
            phase: self.phase,
            requests: self.requests,
            hits: self.hits,
            origin_fetches: self.origin_fetches,
            hit_rate: if self.requests == 0 { 0.0 } else { self.hits as f64 / self.requests as f64 },
            caches,
        }
    }
}

/// Memoised shortest path from a client to the origin
fn memoised_path<'a>(
    routing_table: &'a mut HashMap<NodeHandle, Option<Path>>,
    topology: &Topology,
    client: NodeHandle,
) -> Option<&'a Path> {
    routing_table
        .entry(client)
        .or_insert_with(|| topology.shortest_path(client, topology.origin()))
        .as_ref()
}

fn unreachable(topology: &Topology, client: NodeHandle) -> Error {
    Error::UnreachableNode {
        client: topology.id(client).to_string(),
        origin: topology.id(topology.origin()).to_string(),
    }
}

fn link_weight(topology: &Topology, from: NodeHandle, to: NodeHandle) -> f64 {
    topology
        .neighbors(from)
        .iter()
        .filter(|e| e.to == to)
        .map(|e| e.weight)
        .fold(f64::INFINITY, f64::min)
}
