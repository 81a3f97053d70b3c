use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;
use crate::cache::GenericCache;
use crate::coloring::NearestColorTable;
use crate::error::{Error, Result};

pub const NEAREST_COLOR_FILE: &str = "nearest-color.json";

/// The cache contents of one warmed generation, keyed by router id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub run_index: usize,
    pub caches: BTreeMap<String, GenericCache>,
}

pub fn snapshot_path(dir: &Path, run_index: usize) -> PathBuf {
    dir.join(format!("cache-snapshot-{run_index}.json"))
}

/// Serialises `value` next to `path` and renames it into place, so a failed write never leaves a
/// partial file behind as the canonical copy
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::persistence(path, std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name")))?;
    let temp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    let written = (|| -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(&temp)?);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();
    match written.and_then(|_| fs::rename(&temp, path)) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Best effort, the original error is the one worth reporting
            let _ = fs::remove_file(&temp);
            Err(Error::persistence(path, e))
        }
    }
}

pub fn read<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| Error::persistence(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| Error::persistence(path, e))
}

/// Writes `cache-snapshot-<run>.json` into `dir`, returning its path
pub fn save_snapshot(dir: &Path, snapshot: &CacheSnapshot) -> Result<PathBuf> {
    let path = snapshot_path(dir, snapshot.run_index);
    write_atomic(&path, snapshot)?;
    info!(path = %path.display(), caches = snapshot.caches.len(), "cache snapshot written");
    Ok(path)
}

pub fn load_snapshot(dir: &Path, run_index: usize) -> Result<CacheSnapshot> {
    read(&snapshot_path(dir, run_index))
}

pub fn save_nearest_color_table(dir: &Path, table: &NearestColorTable) -> Result<PathBuf> {
    let path = dir.join(NEAREST_COLOR_FILE);
    write_atomic(&path, table)?;
    info!(path = %path.display(), clients = table.entries.len(), "nearest-color table written");
    Ok(path)
}

pub fn load_nearest_color_table(dir: &Path) -> Result<NearestColorTable> {
    read(&dir.join(NEAREST_COLOR_FILE))
}
