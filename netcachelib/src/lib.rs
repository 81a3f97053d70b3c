//! # NetCacheLib
//!
//! NetCacheLib simulates in-network caching: routers on a bandwidth-weighted topology run cache
//! stores of several eviction disciplines, clients issue synthetic requests drawn from a content
//! popularity model, and a warm-up phase populates the caches along shortest paths before any
//! measurement starts
//!
//! Cache responsibility can be partitioned across routers by coloring them, in which case
//! color-partitioned stores keep their own color's content and requests can be steered to the
//! nearest cache of the content's color
//!
//! Every simulation is single threaded and reproducible: the same configuration and seed produce
//! the same caches

/// Contains the cache store contract, the generic cache, the color-partitioned cache, and a
/// utility enum for the existing cache types
pub mod cache;

/// Assigns colors to cache-capable routers and computes the nearest-color table
pub mod coloring;

/// Contains definitions for the JSON network description and the runtime options
pub mod config;

/// Popularity models, reservoir sampling and request generation
pub mod content;

/// The error taxonomy shared by every operation
pub mod error;

/// Trace file access
pub mod io;

/// Atomic snapshot writes and reads
pub mod persist;

/// Contains the provided replacement policies, with a trait for implementing custom replacement
/// policies
pub mod replacement_policies;

/// Contains the simulator: reconfiguration, warm-up and request routing
pub mod simulator;

/// The network graph and shortest paths
pub mod topology;

#[cfg(test)]
mod test;

pub use error::{Error, Result};
