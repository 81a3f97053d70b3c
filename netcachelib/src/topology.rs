use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use crate::cache::GenericCache;
use crate::config::{CacheTypeConfig, LinkConfig, NetworkConfig, RequestModel, ORIGIN_ID};
use crate::error::{Error, Result};

/// The implicit temporary client every network carries
pub const MAIN_CLONE_ID: &str = "mainClone";

lazy_static! {
    // Splits an interface address into everything before the host octet, the host octet, and the mask
    static ref HOST_OCTET: Regex = Regex::new(r"^(?P<net>.*)\.(?P<host>\d+)/(?P<mask>.*)$").unwrap();
}

/// Stable handle of a node, its position in declaration order (routers first, then clients)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeHandle(pub usize);

/// How a cache-capable router is provisioned
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSpec {
    pub kind: CacheTypeConfig,
    pub max_size: f64,
    pub capacity_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Router { cache: Option<CacheSpec> },
    Client { gateway: String, is_temp: bool },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub ip: String,
    pub kind: NodeKind,
}

/// One direction of an undirected link
#[derive(Debug, Clone)]
pub struct Edge {
    pub to: NodeHandle,
    /// Inverse bandwidth
    pub weight: f64,
    pub local_interface: String,
    pub local_ip: String,
    pub remote_interface: String,
    pub remote_ip: String,
}

/// A weighted walk between two nodes, endpoints included
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub nodes: Vec<NodeHandle>,
    pub cost: f64,
}

impl Path {
    /// The nodes strictly between the endpoints, nearest the source first
    pub fn intermediate(&self) -> &[NodeHandle] {
        if self.nodes.len() < 2 {
            &[]
        } else {
            &self.nodes[1..self.nodes.len() - 1]
        }
    }
}

#[derive(Copy, Clone, PartialEq)]
struct State {
    cost: f64,
    node: NodeHandle,
}

impl Eq for State {}

// Reversed so the binary heap pops the cheapest state, lowest handle first on ties
impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.total_cmp(&self.cost).then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Shortest-path distances from one source to every node
#[derive(Debug, Clone)]
pub struct ShortestPaths {
    source: NodeHandle,
    pub distances: Vec<f64>,
    predecessors: Vec<Option<NodeHandle>>,
}

impl ShortestPaths {
    pub fn distance(&self, to: NodeHandle) -> Option<f64> {
        let d = self.distances[to.0];
        d.is_finite().then_some(d)
    }

    pub fn path_to(&self, to: NodeHandle) -> Option<Path> {
        let cost = self.distance(to)?;
        let mut nodes = vec![to];
        let mut current = to;
        while current != self.source {
            current = self.predecessors[current.0]?;
            nodes.push(current);
        }
        nodes.reverse();
        Some(Path { nodes, cost })
    }
}

/// The simulated network: routers, clients, bandwidth-weighted links, and one cache store per
/// cache-capable router
///
/// Nodes and links are immutable after [`Topology::build`], only cache contents change
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<Node>,
    index: HashMap<String, NodeHandle>,
    adjacency: Vec<Vec<Edge>>,
    origin: NodeHandle,
    router_ids: Vec<NodeHandle>,
    client_ids: Vec<NodeHandle>,
    temp_client_ids: Vec<String>,
    cache_routers: Vec<NodeHandle>,
    caches: BTreeMap<NodeHandle, GenericCache>,
    alpha: f64,
}

impl Topology {
    /// Builds the graph from a network description. No caches are allocated until
    /// [`Topology::allocate_caches`]
    pub fn build(config: &NetworkConfig) -> Result<Self> {
        let mut topology = Self {
            nodes: Vec::with_capacity(config.routers.len() + config.clients.len()),
            index: HashMap::new(),
            adjacency: Vec::new(),
            origin: NodeHandle(usize::MAX),
            router_ids: Vec::new(),
            client_ids: Vec::new(),
            temp_client_ids: vec![MAIN_CLONE_ID.to_string()],
            cache_routers: Vec::new(),
            caches: BTreeMap::new(),
            alpha: capacity_scale(config)?,
        };

        for router in &config.routers {
            let cache = match router.cache_type {
                None => None,
                Some(_) if router.id == ORIGIN_ID => {
                    warn!("{ORIGIN_ID} holds every content, ignoring its cache type");
                    None
                }
                Some(kind) => {
                    let max_size = router
                        .max_size
                        .filter(|s| s.is_finite() && *s >= 0.0)
                        .ok_or_else(|| Error::config(format!("cache router {} needs a non-negative maxSize", router.id)))?;
                    if kind == CacheTypeConfig::Hybrid {
                        match router.capacity_ratio {
                            Some(r) if r > 0.0 && r <= 1.0 => {}
                            other => return Err(Error::config(format!("Hybrid router {} needs a capacityRatio in (0, 1], got {other:?}", router.id))),
                        }
                    }
                    Some(CacheSpec { kind, max_size, capacity_ratio: router.capacity_ratio })
                }
            };
            let has_cache = cache.is_some();
            let handle = topology.add_node(&router.id, &router.ip, NodeKind::Router { cache })?;
            if router.id == ORIGIN_ID {
                topology.origin = handle;
            } else {
                topology.router_ids.push(handle);
            }
            if has_cache {
                topology.cache_routers.push(handle);
            }
        }
        if topology.origin.0 == usize::MAX {
            return Err(Error::config(format!("no {ORIGIN_ID} router in the network description")));
        }

        for client in &config.clients {
            let kind = NodeKind::Client { gateway: client.gateway.clone(), is_temp: client.is_temp };
            let handle = topology.add_node(&client.id, &client.ip, kind)?;
            topology.client_ids.push(handle);
            if client.is_temp {
                topology.temp_client_ids.push(client.id.clone());
            }
        }

        for link in &config.links {
            topology.add_link(link)?;
        }

        for client in topology.client_ids.clone() {
            if topology.shortest_path(client, topology.origin).is_none() {
                warn!(client = %topology.nodes[client.0].id, "client cannot reach {ORIGIN_ID}");
            }
        }
        info!(
            routers = topology.router_ids.len(),
            caches = topology.cache_routers.len(),
            clients = topology.client_ids.len(),
            links = config.links.len(),
            "topology built"
        );
        Ok(topology)
    }

    fn add_node(&mut self, id: &str, ip: &str, kind: NodeKind) -> Result<NodeHandle> {
        let handle = NodeHandle(self.nodes.len());
        if self.index.insert(id.to_string(), handle).is_some() {
            return Err(Error::config(format!("duplicate node id {id}")));
        }
        self.nodes.push(Node { id: id.to_string(), ip: ip.to_string(), kind });
        self.adjacency.push(Vec::new());
        Ok(handle)
    }

    fn add_link(&mut self, link: &LinkConfig) -> Result<()> {
        let (id_1, interface_1) = split_interface(&link.node_ids[0])?;
        let bw = link.params1.bw;
        if !(bw.is_finite() && bw > 0.0) {
            return Err(Error::config(format!("link {:?} needs a positive bandwidth, got {bw}", link.node_ids)));
        }
        let ip_1 = link.params1.ip.clone();
        let (id_2, interface_2, ip_2) = match &link.params2 {
            Some(params2) => {
                let (id, interface) = split_interface(&link.node_ids[1])?;
                (id, interface, params2.ip.clone())
            }
            None => (link.node_ids[1].as_str(), "0", peer_ip(&ip_1)?),
        };
        let a = self.lookup(id_1)?;
        let b = self.lookup(id_2)?;
        if a == b {
            return Err(Error::config(format!("link {:?} connects {id_1} to itself", link.node_ids)));
        }
        let weight = 1.0 / bw;
        self.adjacency[a.0].push(Edge {
            to: b,
            weight,
            local_interface: interface_1.to_string(),
            local_ip: ip_1.clone(),
            remote_interface: interface_2.to_string(),
            remote_ip: ip_2.clone(),
        });
        self.adjacency[b.0].push(Edge {
            to: a,
            weight,
            local_interface: interface_2.to_string(),
            local_ip: ip_2,
            remote_interface: interface_1.to_string(),
            remote_ip: ip_1,
        });
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<NodeHandle> {
        self.handle(id).ok_or_else(|| Error::config(format!("link references unknown node {id}")))
    }

    pub fn handle(&self, id: &str) -> Option<NodeHandle> {
        self.index.get(id).copied()
    }

    pub fn node(&self, handle: NodeHandle) -> &Node {
        &self.nodes[handle.0]
    }

    pub fn id(&self, handle: NodeHandle) -> &str {
        &self.nodes[handle.0].id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn origin(&self) -> NodeHandle {
        self.origin
    }

    /// Every router except the origin, in declaration order
    pub fn router_ids(&self) -> &[NodeHandle] {
        &self.router_ids
    }

    pub fn client_ids(&self) -> &[NodeHandle] {
        &self.client_ids
    }

    /// Identifiers of temporary clients, starting with [`MAIN_CLONE_ID`]
    pub fn temp_client_ids(&self) -> &[String] {
        &self.temp_client_ids
    }

    /// Cache-capable routers in declaration order
    pub fn cache_routers(&self) -> &[NodeHandle] {
        &self.cache_routers
    }

    pub fn neighbors(&self, handle: NodeHandle) -> &[Edge] {
        &self.adjacency[handle.0]
    }

    pub fn is_client(&self, handle: NodeHandle) -> bool {
        matches!(self.nodes[handle.0].kind, NodeKind::Client { .. })
    }

    /// Capacity multiplier applied to every configured size
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// The configured `maxSize` of every cache router, in declaration order
    pub fn default_capacities(&self) -> Vec<f64> {
        self.cache_routers
            .iter()
            .filter_map(|h| match &self.nodes[h.0].kind {
                NodeKind::Router { cache: Some(spec) } => Some(spec.max_size),
                _ => None,
            })
            .collect()
    }

    /// Replaces every cache store with an empty one of the given capacity, in cache router
    /// declaration order. The previous generation is discarded in full
    pub fn allocate_caches(&mut self, capacities: &[f64]) -> Result<()> {
        if capacities.len() != self.cache_routers.len() {
            return Err(Error::config(format!(
                "expected {} cache sizes, got {}",
                self.cache_routers.len(),
                capacities.len()
            )));
        }
        let mut caches = BTreeMap::new();
        for (handle, size) in self.cache_routers.iter().zip(capacities) {
            if !(size.is_finite() && *size >= 0.0) {
                return Err(Error::config(format!("cache size for {} must be non-negative, got {size}", self.id(*handle))));
            }
            let NodeKind::Router { cache: Some(spec) } = &self.nodes[handle.0].kind else {
                return Err(Error::config(format!("{} has no cache spec", self.id(*handle))));
            };
            let capacity = (size * self.alpha).floor() as u64;
            caches.insert(*handle, GenericCache::new(spec.kind, capacity, spec.capacity_ratio)?);
        }
        self.caches = caches;
        debug!(caches = self.caches.len(), "allocated cache generation");
        Ok(())
    }

    /// Drops every cache store
    pub fn clear_caches(&mut self) {
        self.caches.clear();
    }

    pub fn caches(&self) -> &BTreeMap<NodeHandle, GenericCache> {
        &self.caches
    }

    pub(crate) fn replace_caches(&mut self, caches: BTreeMap<NodeHandle, GenericCache>) {
        self.caches = caches;
    }

    pub fn cache(&self, handle: NodeHandle) -> Option<&GenericCache> {
        self.caches.get(&handle)
    }

    pub fn cache_mut(&mut self, handle: NodeHandle) -> Option<&mut GenericCache> {
        self.caches.get_mut(&handle)
    }

    /// Dijkstra from `source` over link weights. Clients other than the source are never used as
    /// transit nodes
    pub fn shortest_paths_from(&self, source: NodeHandle) -> ShortestPaths {
        let mut distances = vec![f64::INFINITY; self.nodes.len()];
        let mut predecessors = vec![None; self.nodes.len()];
        let mut heap = BinaryHeap::new();
        distances[source.0] = 0.0;
        heap.push(State { cost: 0.0, node: source });
        while let Some(State { cost, node }) = heap.pop() {
            if cost > distances[node.0] {
                continue;
            }
            if node != source && self.is_client(node) {
                continue;
            }
            for edge in &self.adjacency[node.0] {
                let next = cost + edge.weight;
                if next < distances[edge.to.0] {
                    distances[edge.to.0] = next;
                    predecessors[edge.to.0] = Some(node);
                    heap.push(State { cost: next, node: edge.to });
                }
            }
        }
        ShortestPaths { source, distances, predecessors }
    }

    pub fn shortest_path(&self, from: NodeHandle, to: NodeHandle) -> Option<Path> {
        self.shortest_paths_from(from).path_to(to)
    }
}

fn capacity_scale(config: &NetworkConfig) -> Result<f64> {
    match config.request_models.selected()? {
        RequestModel::Custom(custom) if config.file_size == -1 => {
            if custom.alpha.is_finite() && custom.alpha > 0.0 {
                Ok(custom.alpha)
            } else {
                Err(Error::config(format!("custom alpha must be positive, got {}", custom.alpha)))
            }
        }
        _ => Ok(1.0),
    }
}

fn split_interface(node_id: &str) -> Result<(&str, &str)> {
    node_id
        .split_once('/')
        .ok_or_else(|| Error::config(format!("link endpoint {node_id} is not in node/interface form")))
}

/// Derives the far end of a point-to-point link from the near end's address
fn peer_ip(ip: &str) -> Result<String> {
    let captures = HOST_OCTET
        .captures(ip)
        .ok_or_else(|| Error::config(format!("cannot derive a peer address from {ip}")))?;
    let peer = match &captures["host"] {
        "1" => "2",
        "2" => "1",
        "65" => "66",
        "66" => "65",
        _ => return Err(Error::config(format!("cannot derive a peer address from {ip}"))),
    };
    Ok(format!("{}.{peer}/{}", &captures["net"], &captures["mask"]))
}
