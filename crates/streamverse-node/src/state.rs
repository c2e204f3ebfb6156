use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::info;

use streamverse_core::gate::{GateConfig, PaymentGate};
use streamverse_core::payment::{SCHEME_EXACT, SCHEME_VOUCHER};
use streamverse_core::replay::SqliteReplayStore;
use streamverse_core::settlement::SettlementVerifier;
use streamverse_core::storage::{FsObjectStore, ObjectStore};
use streamverse_core::voucher::VoucherVerifier;

use crate::catalog::{self, AssetEntry};
use crate::events::{ConsoleEmitter, ConsoleEvent, EventLog};
use crate::facilitator::FacilitatorVerifier;
use crate::videos::VideoStore;

// ---------------------------------------------------------------------------
// Node configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub storage_dir: PathBuf,
    pub gate: GateConfig,
    /// When set, payments settle through this x402 facilitator and the gate
    /// asks for the `exact` scheme. Otherwise vouchers are verified locally.
    pub facilitator_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Axum app state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<PaymentGate>,
    pub objects: Arc<dyn ObjectStore>,
    pub catalog: Arc<Mutex<Vec<AssetEntry>>>,
    pub videos: Arc<VideoStore>,
    pub emitter: Arc<ConsoleEmitter>,
    pub replay: Arc<SqliteReplayStore>,
    pub storage_dir: PathBuf,
}

impl AppState {
    /// Open every store under `config.storage_dir`, creating what is missing.
    pub fn open(config: NodeConfig) -> Result<Self> {
        let dir = config.storage_dir;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating storage dir {}", dir.display()))?;

        let objects = FsObjectStore::new(objects_dir(&dir)).context("opening object store")?;
        let catalog = catalog::load_catalog(&dir).context("loading catalog")?;
        info!(
            entries = catalog.len(),
            path = %catalog::catalog_path(&dir).display(),
            "catalog loaded"
        );

        let videos = VideoStore::open(&dir.join("videos.db")).context("opening videos.db")?;
        let log = EventLog::open(&dir).context("opening events.db")?;
        let (tx, _) = broadcast::channel::<ConsoleEvent>(256);
        let emitter = ConsoleEmitter::new(tx, Some(Arc::new(log)));
        let replay = Arc::new(
            SqliteReplayStore::open(&dir.join("replay.db")).context("opening replay.db")?,
        );

        let mut gate_config = config.gate;
        let verifier: Arc<dyn SettlementVerifier> = match &config.facilitator_url {
            Some(url) => {
                gate_config.scheme = SCHEME_EXACT.into();
                info!(%url, "settling through facilitator");
                Arc::new(
                    FacilitatorVerifier::new(url, gate_config.verify_timeout)
                        .context("building facilitator client")?,
                )
            }
            None => {
                gate_config.scheme = SCHEME_VOUCHER.into();
                Arc::new(VoucherVerifier::new(gate_config.replay_window))
            }
        };
        let gate = PaymentGate::new(gate_config, verifier, replay.clone());

        Ok(Self {
            gate: Arc::new(gate),
            objects: Arc::new(objects),
            catalog: Arc::new(Mutex::new(catalog)),
            videos: Arc::new(videos),
            emitter: Arc::new(emitter),
            replay,
            storage_dir: dir,
        })
    }

    pub fn find_asset(&self, content_address: &str) -> Option<AssetEntry> {
        let cat = self.catalog.lock().unwrap();
        catalog::find(&cat, content_address).cloned()
    }
}

pub fn objects_dir(storage_dir: &Path) -> PathBuf {
    storage_dir.join("objects")
}

/// Drop expired replay records every `every`. Runs until the runtime stops.
pub fn spawn_replay_purge(replay: Arc<SqliteReplayStore>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tick.tick().await;
            match replay.purge_expired() {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "expired replay records purged"),
                Err(e) => tracing::warn!("replay purge failed: {e}"),
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ChunkQuery {
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub index: Option<String>,
}

#[derive(Deserialize)]
pub struct InfoQuery {
    #[serde(default)]
    pub asset: Option<String>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct EventsHistoryQuery {
    #[serde(default)]
    pub since_id: Option<u64>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: Option<String>,
}
