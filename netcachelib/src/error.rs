use std::path::PathBuf;
use thiserror::Error;

use crate::content::ContentId;

/// Result type alias using the simulator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building, reconfiguring or warming up a simulated network
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or inconsistent topology or request model. Always raised before simulation starts
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single item does not fit in the cache region it was offered to. The request is still
    /// served upstream, the content just isn't cached
    #[error("Content {content} of size {size} exceeds cache capacity {capacity}")]
    CapacityExceeded {
        content: ContentId,
        size: u64,
        capacity: u64,
    },

    /// No path exists between a client and the origin
    #[error("No path from {client} to origin {origin}")]
    UnreachableNode { client: String, origin: String },

    /// Snapshot write or read failed
    #[error("Persistence failed for {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Warm-up was interrupted, the partially warmed caches were discarded
    #[error("Warm-up cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        Error::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }
}
