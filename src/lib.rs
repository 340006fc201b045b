pub mod batch;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod db;
pub mod errors;
pub mod geocode;
pub mod ingestion;
pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::RefreshOutcome;
pub use crate::cluster::{
    ClusterOutcome, ClusterSummary, ClusteringRun, DataPoint, CLUSTER_COUNT,
};
pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::geocode::{
    GeocodeResolver, GeocodeService, PostcodeLookup, ResolveStats, ResolvedLocation,
    INVALID_REGION,
};
pub use crate::ingestion::{AddressRecord, ImportSummary};

use crate::cache::LocationCache;
use crate::cluster::ClusterEngine;
use crate::db::{bootstrap, DatabaseContext};
use crate::ingestion::{import_records, parse_address_records};

pub struct Pipeline {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    config: AppConfig,
    cache: LocationCache,
    resolver: GeocodeResolver,
}

impl Pipeline {
    pub fn open<P: AsRef<Path>>(data_dir: P, config: AppConfig) -> AppResult<Self> {
        let service = GeocodeService::new(&config)?;
        Self::open_with_service(data_dir, config, service)
    }

    pub fn open_with_lookup<P: AsRef<Path>>(
        data_dir: P,
        config: AppConfig,
        lookup: Arc<dyn PostcodeLookup>,
    ) -> AppResult<Self> {
        Self::open_with_service(data_dir, config, GeocodeService::from_lookup(lookup))
    }

    fn open_with_service<P: AsRef<Path>>(
        data_dir: P,
        config: AppConfig,
        service: GeocodeService,
    ) -> AppResult<Self> {
        init_tracing();
        let DatabaseContext { connection, path } =
            bootstrap(data_dir.as_ref(), &config.database_file_name)?;
        let db = Arc::new(Mutex::new(connection));
        let resolver = GeocodeResolver::new(service, config.workers);
        let cache = LocationCache::new(Arc::clone(&db), &config);
        Ok(Self {
            db,
            db_path: path,
            config,
            cache,
            resolver,
        })
    }

    pub fn import_csv<P: AsRef<Path>>(&self, path: P) -> AppResult<ImportSummary> {
        let bytes = std::fs::read(path)?;
        let records = parse_address_records(&bytes)?;
        self.import_address_records(&records)
    }

    pub fn import_address_records(&self, records: &[AddressRecord]) -> AppResult<ImportSummary> {
        let mut conn = self.db.lock();
        import_records(&mut conn, records)
    }

    pub fn is_csv_stale(&self) -> AppResult<bool> {
        self.cache.is_csv_stale()
    }

    pub fn is_location_stale(&self) -> AppResult<bool> {
        self.cache.is_location_stale()
    }

    pub async fn refresh_if_stale(
        &self,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<RefreshOutcome> {
        self.cache.refresh_if_stale(&self.resolver, cancel_flag).await
    }

    pub async fn resolve_all(
        &self,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<ResolveStats> {
        self.cache.resolve_all(&self.resolver, cancel_flag).await
    }

    pub async fn cluster(&self) -> AppResult<ClusteringRun> {
        self.refresh_if_stale(None).await?;
        let points = self.load_points()?;
        Ok(ClusterEngine::new(points)?.run())
    }

    pub fn email_domain_counts(&self) -> AppResult<Vec<(String, usize)>> {
        let conn = self.db.lock();
        stats::email_domain_counts(&conn)
    }

    pub fn region_counts(&self) -> AppResult<Vec<(String, usize)>> {
        let conn = self.db.lock();
        stats::region_counts(&conn)
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn load_points(&self) -> AppResult<Vec<DataPoint>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT longitude, latitude FROM locations
            WHERE longitude IS NOT NULL AND latitude IS NOT NULL
            ORDER BY id ASC",
        )?;
        let points = stmt
            .query_map([], |row| {
                Ok(DataPoint {
                    longitude: row.get(0)?,
                    latitude: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(points)
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,postcode_clusterer=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
