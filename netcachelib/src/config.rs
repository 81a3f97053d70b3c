use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};

/// The identifier of the authoritative content source in every network description
pub const ORIGIN_ID: &str = "mainServer";

/// A complete network description, as produced by the topology generator
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "Routers")]
    pub routers: Vec<RouterConfig>,
    #[serde(rename = "Clients")]
    pub clients: Vec<ClientConfig>,
    #[serde(rename = "Links")]
    pub links: Vec<LinkConfig>,
    #[serde(rename = "RequestModels")]
    pub request_models: RequestModelsConfig,
    #[serde(rename = "samplingMethod", default)]
    pub sampling_method: Option<SamplingConfig>,
    /// Fixed content size in bytes, or -1 when sizes come from the trace
    #[serde(rename = "FileSize")]
    pub file_size: i64,
}

impl NetworkConfig {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        serde_json::from_reader(reader).map_err(|e| Error::config(format!("Couldn't parse the network description: {e}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::config(format!("Couldn't open the network description at {}: {e}", path.display())))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Routers carrying a cache, in declaration order
    pub fn cache_routers(&self) -> impl Iterator<Item = &RouterConfig> {
        self.routers.iter().filter(|r| r.cache_type.is_some())
    }
}

/// A router. Routers without a `type` are pass-through
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "type", default)]
    pub cache_type: Option<CacheTypeConfig>,
    #[serde(rename = "maxSize", default)]
    pub max_size: Option<f64>,
    #[serde(rename = "capacityRatio", default)]
    pub capacity_ratio: Option<f64>,
}

/// The eviction discipline of a cache-capable router
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum CacheTypeConfig {
    #[serde(rename = "LRU", alias = "lru")]
    LeastRecentlyUsed,
    #[serde(rename = "LFU", alias = "lfu")]
    LeastFrequentlyUsed,
    #[serde(rename = "FIFO", alias = "fifo")]
    FirstInFirstOut,
    #[serde(rename = "Hybrid", alias = "hybrid")]
    Hybrid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub gateway: String,
    #[serde(rename = "isTemp", default)]
    pub is_temp: bool,
}

/// An undirected link. `NodeIds` use `node/interface` notation
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    #[serde(rename = "NodeIds")]
    pub node_ids: [String; 2],
    pub params1: LinkParams,
    #[serde(default)]
    pub params2: Option<LinkParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkParams {
    pub ip: String,
    pub bw: f64,
}

/// The request model block. When several models are present, `custom` wins over `gamma`, which
/// wins over `zipf`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestModelsConfig {
    #[serde(default)]
    pub gamma: Option<GammaConfig>,
    #[serde(default)]
    pub zipf: Option<ZipfConfig>,
    #[serde(default)]
    pub custom: Option<CustomConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GammaConfig {
    #[serde(rename = "K")]
    pub k: f64,
    #[serde(rename = "Theta")]
    pub theta: f64,
    #[serde(rename = "contentNums")]
    pub content_nums: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZipfConfig {
    #[serde(rename = "Skewness")]
    pub skewness: f64,
    #[serde(rename = "contentNums")]
    pub content_nums: u64,
}

/// Trace replay. `alpha` scales every cache capacity when content sizes come from the trace
#[derive(Debug, Clone, Deserialize)]
pub struct CustomConfig {
    pub path: PathBuf,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_alpha() -> f64 {
    1.0
}

/// The selected request model
#[derive(Debug, Clone)]
pub enum RequestModel<'a> {
    Custom(&'a CustomConfig),
    Gamma(&'a GammaConfig),
    Zipf(&'a ZipfConfig),
}

impl RequestModelsConfig {
    pub fn selected(&self) -> Result<RequestModel<'_>> {
        if let Some(custom) = &self.custom {
            Ok(RequestModel::Custom(custom))
        } else if let Some(gamma) = &self.gamma {
            Ok(RequestModel::Gamma(gamma))
        } else if let Some(zipf) = &self.zipf {
            Ok(RequestModel::Zipf(zipf))
        } else {
            Err(Error::config("RequestModels must define one of gamma, zipf or custom"))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    pub method: String,
    /// Reservoir capacity, in requests
    #[serde(rename = "sampleRate")]
    pub sample_rate: usize,
}

impl SamplingConfig {
    /// The reservoir capacity, if the method is one this simulator knows. Unknown methods disable
    /// sampling
    pub fn reservoir_capacity(&self) -> Option<usize> {
        (self.method.eq_ignore_ascii_case("reservoir")).then_some(self.sample_rate)
    }
}

/// How a simulation instance behaves on warm-up
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Mode {
    /// Caches are never warmed, used as a baseline
    NoCache,
    /// Shortest-path warm-up without coloring
    NoColor,
    /// Color the caches only
    TagColor,
    /// Color the caches and publish the nearest-color table for live routing
    Colored(String),
}

impl Mode {
    pub fn is_colored(&self) -> bool {
        matches!(self, Mode::TagColor | Mode::Colored(_))
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(Error::config("mode must not be empty")),
            "no-cache" => Ok(Mode::NoCache),
            "no-color" => Ok(Mode::NoColor),
            "tag-color" => Ok(Mode::TagColor),
            other => Ok(Mode::Colored(other.to_string())),
        }
    }
}

impl TryFrom<String> for Mode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Mode> for String {
    fn from(value: Mode) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::NoCache => f.write_str("no-cache"),
            Mode::NoColor => f.write_str("no-color"),
            Mode::TagColor => f.write_str("tag-color"),
            Mode::Colored(name) => f.write_str(name),
        }
    }
}

/// Runtime options supplied alongside the network description
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub mode: Mode,
    /// Number of synthetic requests each client issues during warm-up
    pub warm_up_requests: usize,
    /// Colors to distribute across the caches. `None` falls back to a single implicit color
    pub colors: Option<Vec<u32>>,
    pub seed: u64,
    /// Where cache snapshots and the nearest-color table are written. `None` disables persistence
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            mode: Mode::NoColor,
            warm_up_requests: 1000,
            colors: None,
            seed: 0,
            snapshot_dir: None,
        }
    }
}
