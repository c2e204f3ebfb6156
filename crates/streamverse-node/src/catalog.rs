use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use streamverse_core::chunk::{chunk_count, ChunkPlan, MAX_CHUNKS};
use streamverse_core::gate::GateConfig;
use streamverse_core::storage::{FsObjectStore, StorageError};
use streamverse_core::voucher::unix_now;
use streamverse_core::AssetInfo;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog is corrupt: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid asset: {0}")]
    Invalid(String),
}

/// One registered asset. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub content_address: String,
    #[serde(default)]
    pub title: Option<String>,
    pub size_bytes: u64,
    pub duration_secs: f64,
    pub chunk_duration_secs: f64,
    /// Atomic units.
    pub price_per_chunk: u64,
    /// Unix seconds.
    pub registered_at: u64,
}

impl AssetEntry {
    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan::new(self.duration_secs, self.size_bytes, self.chunk_duration_secs)
    }

    /// Price of every chunk, in atomic units. Saturates.
    pub fn total_price(&self) -> u64 {
        self.price_per_chunk
            .saturating_mul(u64::from(self.plan().count()))
    }

    pub fn info(&self, gate: &GateConfig) -> AssetInfo {
        AssetInfo::describe(
            &self.content_address,
            self.title.clone(),
            self.duration_secs,
            self.chunk_duration_secs,
            self.size_bytes,
            self.price_per_chunk,
            &gate.network,
            &gate.pay_to,
            &gate.currency,
        )
    }
}

pub fn catalog_path(storage_dir: &Path) -> PathBuf {
    storage_dir.join("catalog.json")
}

/// Load the catalog. A missing file is an empty catalog.
pub fn load_catalog(storage_dir: &Path) -> Result<Vec<AssetEntry>, CatalogError> {
    let path = catalog_path(storage_dir);
    match std::fs::read_to_string(&path) {
        Ok(data) => Ok(serde_json::from_str(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn save_catalog(storage_dir: &Path, catalog: &[AssetEntry]) -> Result<(), CatalogError> {
    std::fs::create_dir_all(storage_dir)?;
    let path = catalog_path(storage_dir);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(catalog)?)?;
    std::fs::rename(&tmp, &path)?;
    info!(path = %path.display(), entries = catalog.len(), "catalog saved");
    Ok(())
}

pub fn find<'a>(catalog: &'a [AssetEntry], content_address: &str) -> Option<&'a AssetEntry> {
    catalog
        .iter()
        .find(|e| e.content_address.eq_ignore_ascii_case(content_address))
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub file: PathBuf,
    pub duration_secs: f64,
    pub chunk_duration_secs: f64,
    pub price_per_chunk: u64,
    pub title: Option<String>,
}

/// Copy the file into the object store and add it to the catalog.
/// Returns the entry and whether it was new; registering the same bytes
/// again returns the existing entry unchanged.
pub fn register(
    storage_dir: &Path,
    objects: &FsObjectStore,
    catalog: &mut Vec<AssetEntry>,
    req: RegisterRequest,
) -> Result<(AssetEntry, bool), CatalogError> {
    if !req.duration_secs.is_finite() || req.duration_secs <= 0.0 {
        return Err(CatalogError::Invalid(format!(
            "duration must be positive, got {}",
            req.duration_secs
        )));
    }
    if !req.chunk_duration_secs.is_finite() || req.chunk_duration_secs <= 0.0 {
        return Err(CatalogError::Invalid(format!(
            "chunk duration must be positive, got {}",
            req.chunk_duration_secs
        )));
    }
    let chunks = chunk_count(req.duration_secs, req.chunk_duration_secs);
    if chunks > MAX_CHUNKS {
        return Err(CatalogError::Invalid(format!(
            "{chunks} chunks is more than the limit of {MAX_CHUNKS}"
        )));
    }

    let (address, size) = objects.import_file(&req.file)?;
    if size == 0 {
        return Err(CatalogError::Invalid(format!(
            "{} is empty",
            req.file.display()
        )));
    }

    if let Some(existing) = find(catalog, &address) {
        if existing.duration_secs != req.duration_secs
            || existing.chunk_duration_secs != req.chunk_duration_secs
            || existing.price_per_chunk != req.price_per_chunk
        {
            warn!(%address, "asset already registered with different terms; keeping the original");
        }
        return Ok((existing.clone(), false));
    }

    let entry = AssetEntry {
        content_address: address,
        title: req.title,
        size_bytes: size,
        duration_secs: req.duration_secs,
        chunk_duration_secs: req.chunk_duration_secs,
        price_per_chunk: req.price_per_chunk,
        registered_at: unix_now(),
    };
    catalog.push(entry.clone());
    save_catalog(storage_dir, catalog)?;
    info!(
        address = %entry.content_address,
        size,
        chunks = entry.plan().count(),
        "asset registered"
    );
    Ok((entry, true))
}
