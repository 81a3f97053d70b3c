use std::collections::{BTreeMap, BTreeSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use crate::content::ContentId;
use crate::error::{Error, Result};
use crate::topology::{NodeHandle, Topology};

/// A partition label for cache-capable routers
pub type ColorId = u32;

/// The color a piece of content belongs to. Content ids are spread round-robin over the palette
pub fn content_color(content: ContentId, palette: &[ColorId]) -> Option<ColorId> {
    if palette.is_empty() {
        return None;
    }
    palette.get((content % palette.len() as u64) as usize).copied()
}

/// The closest server carrying a color, as seen from one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestServer {
    pub server: NodeHandle,
    pub server_id: String,
    pub cost: f64,
}

/// For every client and color, the nearest server carrying that color. Read-only between
/// topology rebuilds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NearestColorTable {
    pub entries: BTreeMap<String, BTreeMap<ColorId, NearestServer>>,
}

impl NearestColorTable {
    pub fn get(&self, client_id: &str, color: ColorId) -> Option<&NearestServer> {
        self.entries.get(client_id)?.get(&color)
    }
}

/// The outcome of coloring a topology
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColoringInfo {
    pub palette: Vec<ColorId>,
    pub server_colors: BTreeMap<NodeHandle, ColorId>,
    pub nearest: NearestColorTable,
}

/// Assigns a color to every cache-capable router and computes the nearest-color table
///
/// Routers are visited most-shared first, where sharing is the number of client-to-origin
/// shortest paths crossing the router. Each router takes the color that
/// 1. the fewest already-colored routers it shares a client path with, or is linked to, carry
/// 2. the fewest routers carry overall
/// 3. comes first in the palette
///
/// An unused color always wins the first two criteria, so every color is used as soon as there
/// are at least as many routers as colors. Without a color list a single implicit color 0 is used
pub fn colorize(topology: &Topology, color_list: Option<&[ColorId]>) -> Result<ColoringInfo> {
    let palette = match color_list {
        None => vec![0],
        Some([]) => return Err(Error::config("the color list must not be empty")),
        Some(colors) => {
            let distinct: BTreeSet<_> = colors.iter().collect();
            if distinct.len() != colors.len() {
                return Err(Error::config(format!("the color list {colors:?} repeats a color")));
            }
            colors.to_vec()
        }
    };

    let caches: BTreeSet<NodeHandle> = topology.cache_routers().iter().copied().collect();
    let mut coverage: BTreeMap<NodeHandle, usize> = caches.iter().map(|h| (*h, 0)).collect();
    let mut path_mates: BTreeMap<NodeHandle, BTreeSet<NodeHandle>> = BTreeMap::new();
    for client in topology.client_ids() {
        let Some(path) = topology.shortest_path(*client, topology.origin()) else {
            warn!(client = topology.id(*client), "unreachable client left out of coloring");
            continue;
        };
        let on_path: Vec<NodeHandle> = path.intermediate().iter().copied().filter(|h| caches.contains(h)).collect();
        for router in &on_path {
            *coverage.entry(*router).or_default() += 1;
            path_mates
                .entry(*router)
                .or_default()
                .extend(on_path.iter().copied().filter(|other| other != router));
        }
    }
    for router in &caches {
        let linked = topology.neighbors(*router).iter().map(|e| e.to).filter(|h| caches.contains(h));
        path_mates.entry(*router).or_default().extend(linked);
    }

    let mut order: Vec<NodeHandle> = caches.iter().copied().collect();
    order.sort_by(|a, b| coverage[b].cmp(&coverage[a]).then(a.cmp(b)));

    let mut server_colors: BTreeMap<NodeHandle, ColorId> = BTreeMap::new();
    let mut usage: BTreeMap<ColorId, usize> = palette.iter().map(|c| (*c, 0)).collect();
    for router in order {
        let mates = &path_mates[&router];
        let chosen = palette
            .iter()
            .enumerate()
            .min_by_key(|(position, color)| {
                let conflicts = mates.iter().filter(|m| server_colors.get(*m) == Some(*color)).count();
                (conflicts, usage[*color], *position)
            })
            .map(|(_, color)| *color)
            .unwrap_or(palette[0]);
        server_colors.insert(router, chosen);
        *usage.entry(chosen).or_default() += 1;
    }
    debug!(?usage, "colored {} routers", server_colors.len());

    let nearest = nearest_color_table(topology, &server_colors);
    Ok(ColoringInfo { palette, server_colors, nearest })
}

/// For each client and color, the server with the lowest path weight carrying that color. Ties go
/// to the lowest node handle
pub fn nearest_color_table(topology: &Topology, server_colors: &BTreeMap<NodeHandle, ColorId>) -> NearestColorTable {
    let mut entries = BTreeMap::new();
    for client in topology.client_ids() {
        let paths = topology.shortest_paths_from(*client);
        let mut best: BTreeMap<ColorId, NearestServer> = BTreeMap::new();
        // Handles are visited in ascending order, so a strict comparison keeps the lowest on ties
        for (server, color) in server_colors {
            let Some(cost) = paths.distance(*server) else {
                continue;
            };
            let better = best.get(color).map_or(true, |current| cost < current.cost);
            if better {
                best.insert(*color, NearestServer { server: *server, server_id: topology.id(*server).to_string(), cost });
            }
        }
        entries.insert(topology.id(*client).to_string(), best);
    }
    NearestColorTable { entries }
}
