use std::collections::BTreeMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma};
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::config::{NetworkConfig, RequestModel};
use crate::error::{Error, Result};
use crate::io::load_trace;

/// Identifies one piece of content in the content universe
pub type ContentId = u64;

/// The interval replayed during warm-up
pub const WARM_UP_INTERVAL: &str = "Interval0";

/// Keeps the reservoir's generator apart from the request stream's
const RESERVOIR_SEED_OFFSET: u64 = 0x9E37_79B9_7F4A_7C15;

/// Number of redraws before an out-of-range gamma sample is clamped
const GAMMA_RETRIES: usize = 64;

/// A single request for a piece of content
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ContentRequest {
    pub id: ContentId,
    pub size: u64,
}

/// A recorded request as it appears in a trace file. Sizes are optional when the network uses a
/// fixed content size
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TraceEntry {
    Id(ContentId),
    Sized { id: ContentId, size: u64 },
}

/// Recorded requests, keyed by cache name then by interval name
pub type TraceData = BTreeMap<String, BTreeMap<String, Vec<TraceEntry>>>;

/// Maps a client identifier to the key its requests are recorded under, e.g. `client3` to `Cache3`
pub fn trace_key(client_id: &str) -> String {
    client_id.replace("client", "Cache")
}

/// Where request identifiers come from
#[derive(Debug, Clone)]
pub enum Popularity {
    /// Ranks 0..L-1 with weight (rank + 1)^-skewness, stored as a cumulative distribution
    Zipf { skewness: f64, cdf: Vec<f64> },
    /// floor(Gamma(K, theta)) restricted to [0, L)
    Gamma { shape: f64, scale: f64, length: u64, dist: Gamma<f64> },
    /// An observed frequency table, usually rebuilt from the reservoir
    Empirical { items: Vec<ContentRequest>, cdf: Vec<f64> },
    /// Recorded per-client traces
    Trace { data: TraceData, pooled: Vec<(String, usize)> },
}

impl Popularity {
    pub fn zipf(skewness: f64, length: u64) -> Result<Self> {
        if length == 0 {
            return Err(Error::config("zipf contentNums must be positive"));
        }
        if !skewness.is_finite() || skewness < 0.0 {
            return Err(Error::config(format!("zipf Skewness must be a non-negative number, got {skewness}")));
        }
        let weights = (1..=length).map(|rank| (rank as f64).powf(-skewness));
        Ok(Popularity::Zipf { skewness, cdf: normalised_cdf(weights) })
    }

    pub fn gamma(shape: f64, scale: f64, length: u64) -> Result<Self> {
        if length == 0 {
            return Err(Error::config("gamma contentNums must be positive"));
        }
        let dist = Gamma::new(shape, scale)
            .map_err(|e| Error::config(format!("invalid gamma parameters K={shape}, Theta={scale}: {e}")))?;
        Ok(Popularity::Gamma { shape, scale, length, dist })
    }

    pub fn empirical(observed: &[ContentRequest]) -> Result<Self> {
        let mut counts: BTreeMap<ContentId, (u64, ContentRequest)> = BTreeMap::new();
        for request in observed {
            counts.entry(request.id).or_insert((0, *request)).0 += 1;
        }
        if counts.is_empty() {
            return Err(Error::config("an empirical distribution needs at least one observation"));
        }
        let items = counts.values().map(|(_, r)| *r).collect();
        let cdf = normalised_cdf(counts.values().map(|(c, _)| *c as f64));
        Ok(Popularity::Empirical { items, cdf })
    }

    pub fn trace(data: TraceData) -> Result<Self> {
        // Every non-empty warm-up interval contributes to the pool used for client-agnostic draws
        let pooled: Vec<(String, usize)> = data
            .iter()
            .filter_map(|(key, intervals)| intervals.get(WARM_UP_INTERVAL).map(|e| (key, e.len())))
            .flat_map(|(key, len)| (0..len).map(move |i| (key.clone(), i)))
            .collect();
        if pooled.is_empty() {
            return Err(Error::config(format!("trace holds no {WARM_UP_INTERVAL} requests")));
        }
        Ok(Popularity::Trace { data, pooled })
    }

    /// Number of distinct identifiers this distribution can produce, when known up front
    pub fn universe(&self) -> Option<u64> {
        match self {
            Popularity::Zipf { cdf, .. } => Some(cdf.len() as u64),
            Popularity::Gamma { length, .. } => Some(*length),
            Popularity::Empirical { items, .. } => Some(items.len() as u64),
            Popularity::Trace { .. } => None,
        }
    }
}

fn normalised_cdf(weights: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut cdf: Vec<f64> = weights
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect();
    let total = cdf.last().copied().unwrap_or(1.0);
    cdf.iter_mut().for_each(|c| *c /= total);
    if let Some(last) = cdf.last_mut() {
        *last = 1.0;
    }
    cdf
}

/// Inverse-CDF draw
fn draw_index(cdf: &[f64], rng: &mut StdRng) -> usize {
    let u: f64 = rng.gen();
    cdf.partition_point(|c| *c <= u).min(cdf.len() - 1)
}

fn entry_to_request(entry: &TraceEntry, file_size: Option<u64>) -> Result<ContentRequest> {
    match (entry, file_size) {
        (TraceEntry::Id(id), Some(size)) | (TraceEntry::Sized { id, .. }, Some(size)) => Ok(ContentRequest { id: *id, size }),
        (TraceEntry::Sized { id, size }, None) => Ok(ContentRequest { id: *id, size: *size }),
        (TraceEntry::Id(id), None) => Err(Error::config(format!("trace entry {id} has no size and FileSize is -1"))),
    }
}

/// Fixed-memory uniform subsample of an unbounded request stream (Algorithm R)
///
/// The sampler draws from its own generator so that sampling never perturbs the request stream
#[derive(Debug, Clone)]
pub struct ReservoirSampler {
    capacity: usize,
    seen: u64,
    samples: Vec<ContentRequest>,
    rng: StdRng,
}

impl ReservoirSampler {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            seen: 0,
            samples: Vec::with_capacity(capacity),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Offers one item. The k-th item is kept with probability capacity/k, replacing a uniformly
    /// chosen slot once the reservoir is full
    pub fn offer(&mut self, item: ContentRequest) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(item);
        } else {
            let slot = self.rng.gen_range(0..self.seen);
            if slot < self.capacity as u64 {
                self.samples[slot as usize] = item;
            }
        }
    }

    pub fn samples(&self) -> &[ContentRequest] {
        &self.samples
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Produces synthetic request streams from a popularity model
#[derive(Debug, Clone)]
pub struct ContentGenerator {
    popularity: Popularity,
    /// `None` when sizes come from the trace
    file_size: Option<u64>,
    sampler: Option<ReservoirSampler>,
    rng: StdRng,
}

impl ContentGenerator {
    pub fn new(popularity: Popularity, file_size: Option<u64>, sampler: Option<ReservoirSampler>, seed: u64) -> Result<Self> {
        if file_size.is_none() && !matches!(popularity, Popularity::Trace { .. } | Popularity::Empirical { .. }) {
            return Err(Error::config("FileSize -1 is only valid with a custom request model"));
        }
        if file_size == Some(0) {
            return Err(Error::config("FileSize must be positive"));
        }
        Ok(Self {
            popularity,
            file_size,
            sampler,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Builds the generator selected by the network description
    pub fn from_config(config: &NetworkConfig, seed: u64) -> Result<Self> {
        let file_size = match config.file_size {
            -1 => None,
            size if size > 0 => Some(size as u64),
            other => return Err(Error::config(format!("FileSize must be positive or -1, got {other}"))),
        };
        let popularity = match config.request_models.selected()? {
            RequestModel::Custom(custom) => Popularity::trace(load_trace(&custom.path)?)?,
            RequestModel::Gamma(gamma) => Popularity::gamma(gamma.k, gamma.theta, gamma.content_nums)?,
            RequestModel::Zipf(zipf) => Popularity::zipf(zipf.skewness, zipf.content_nums)?,
        };
        let sampler = config
            .sampling_method
            .as_ref()
            .and_then(|s| s.reservoir_capacity())
            .map(|capacity| ReservoirSampler::new(capacity, seed.wrapping_add(RESERVOIR_SEED_OFFSET)));
        debug!(universe = ?popularity.universe(), reservoir = ?sampler.as_ref().map(|s| s.capacity()), "content model ready");
        Self::new(popularity, file_size, sampler, seed)
    }

    /// Restarts the stream. Two generators reseeded with the same value produce the same requests
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn popularity(&self) -> &Popularity {
        &self.popularity
    }

    pub fn is_trace(&self) -> bool {
        matches!(self.popularity, Popularity::Trace { .. })
    }

    pub fn sampler(&self) -> Option<&ReservoirSampler> {
        self.sampler.as_ref()
    }

    /// Lazily draws `n` requests from the configured distribution. Trace models draw uniformly
    /// from every recorded warm-up request
    pub fn generate(&mut self, n: usize) -> Requests<'_> {
        Requests {
            generator: self,
            scope: None,
            remaining: n,
        }
    }

    /// Like [`Self::generate`], but trace models draw only from the client's own recorded requests
    pub fn generate_for(&mut self, client_id: &str, n: usize) -> Result<Requests<'_>> {
        let scope = match &self.popularity {
            Popularity::Trace { data, .. } => {
                let key = trace_key(client_id);
                let recorded = data.get(&key).and_then(|i| i.get(WARM_UP_INTERVAL)).map_or(0, Vec::len);
                if recorded == 0 {
                    return Err(Error::config(format!("no {WARM_UP_INTERVAL} trace for {client_id} (looked up {key})")));
                }
                Some(key)
            }
            _ => None,
        };
        Ok(Requests {
            generator: self,
            scope,
            remaining: n,
        })
    }

    /// Replays a client's recorded interval verbatim. Only valid for trace models
    pub fn replay(&mut self, client_id: &str, interval: &str) -> Result<Vec<ContentRequest>> {
        let Popularity::Trace { data, .. } = &self.popularity else {
            return Err(Error::config("replay needs a custom request model"));
        };
        let key = trace_key(client_id);
        let entries = data
            .get(&key)
            .and_then(|i| i.get(interval))
            .ok_or_else(|| Error::config(format!("no {interval} trace for {client_id} (looked up {key})")))?;
        let requests = entries
            .iter()
            .map(|e| entry_to_request(e, self.file_size))
            .collect::<Result<Vec<_>>>()?;
        if let Some(sampler) = self.sampler.as_mut() {
            requests.iter().for_each(|r| sampler.offer(*r));
        }
        Ok(requests)
    }

    /// Replaces the configured distribution with the frequency table held by the reservoir
    pub fn reestimate(&mut self) -> Result<()> {
        let sampler = self
            .sampler
            .as_ref()
            .ok_or_else(|| Error::config("re-estimation needs a reservoir sampling method"))?;
        self.popularity = Popularity::empirical(sampler.samples())?;
        debug!(observed = sampler.seen(), distinct = ?self.popularity.universe(), "re-estimated popularity");
        Ok(())
    }

    fn draw(&mut self, scope: Option<&str>) -> Result<ContentRequest> {
        let request = match &self.popularity {
            Popularity::Zipf { cdf, .. } => ContentRequest {
                id: draw_index(cdf, &mut self.rng) as ContentId,
                size: self.fixed_size()?,
            },
            Popularity::Gamma { dist, length, .. } => {
                let mut id = None;
                for _ in 0..GAMMA_RETRIES {
                    let x = dist.sample(&mut self.rng).floor();
                    if x < *length as f64 {
                        id = Some(x as ContentId);
                        break;
                    }
                }
                ContentRequest {
                    id: id.unwrap_or(*length - 1),
                    size: self.fixed_size()?,
                }
            }
            Popularity::Empirical { items, cdf } => {
                let item = items[draw_index(cdf, &mut self.rng)];
                ContentRequest {
                    id: item.id,
                    size: self.file_size.unwrap_or(item.size),
                }
            }
            Popularity::Trace { data, pooled } => {
                let entry = match scope {
                    Some(key) => {
                        let entries = &data[key][WARM_UP_INTERVAL];
                        &entries[self.rng.gen_range(0..entries.len())]
                    }
                    None => {
                        let (key, index) = &pooled[self.rng.gen_range(0..pooled.len())];
                        &data[key.as_str()][WARM_UP_INTERVAL][*index]
                    }
                };
                entry_to_request(entry, self.file_size)?
            }
        };
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.offer(request);
        }
        Ok(request)
    }

    fn fixed_size(&self) -> Result<u64> {
        self.file_size.ok_or_else(|| Error::config("parametric request models need a positive FileSize"))
    }
}

/// A lazy, finite request stream. Every yielded request has already been offered to the reservoir
#[derive(Debug)]
pub struct Requests<'a> {
    generator: &'a mut ContentGenerator,
    scope: Option<String>,
    remaining: usize,
}

impl Iterator for Requests<'_> {
    type Item = Result<ContentRequest>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.generator.draw(self.scope.as_deref()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
