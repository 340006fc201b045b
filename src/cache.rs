use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::batch::partition;
use crate::config::AppConfig;
use crate::db::now_timestamp;
use crate::errors::AppResult;
use crate::geocode::{GeocodeResolver, ResolveStats, ResolvedLocation};

#[derive(Debug)]
pub enum RefreshOutcome {
    Fresh,
    Refreshed(ResolveStats),
}

pub struct LocationCache {
    db: Arc<Mutex<Connection>>,
    ttl: Duration,
    batch_size: usize,
    guard: Arc<AsyncMutex<()>>,
}

impl LocationCache {
    pub fn new(db: Arc<Mutex<Connection>>, config: &AppConfig) -> Self {
        Self {
            db,
            ttl: Duration::hours(config.cache_ttl_hours as i64),
            batch_size: config.batch_size,
            guard: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn is_csv_stale(&self) -> AppResult<bool> {
        Ok(self.exceeds_ttl(self.read_stamp("csv_cached_at")?))
    }

    pub fn is_location_stale(&self) -> AppResult<bool> {
        Ok(self.exceeds_ttl(self.read_stamp("locations_cached_at")?))
    }

    pub async fn refresh_if_stale(
        &self,
        resolver: &GeocodeResolver,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<RefreshOutcome> {
        let _lock = self.guard.lock().await;
        if !self.is_location_stale()? {
            debug!("location cache within ttl; skipping refresh");
            return Ok(RefreshOutcome::Fresh);
        }
        let stats = self.run_refresh(resolver, cancel_flag).await?;
        Ok(RefreshOutcome::Refreshed(stats))
    }

    pub async fn resolve_all(
        &self,
        resolver: &GeocodeResolver,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<ResolveStats> {
        let _lock = self.guard.lock().await;
        self.run_refresh(resolver, cancel_flag).await
    }

    async fn run_refresh(
        &self,
        resolver: &GeocodeResolver,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<ResolveStats> {
        let codes = self.load_postal_codes()?;
        let batches: Vec<_> = partition(&codes, self.batch_size).collect();
        let outcome = resolver.resolve_batches(batches, cancel_flag).await;
        let updated = self.persist_resolved(&outcome.resolved)?;
        info!(
            requested = outcome.stats.requested,
            resolved = outcome.stats.resolved,
            fallback = outcome.stats.via_fallback,
            failed_batches = outcome.stats.failed_batches,
            dropped = outcome.stats.dropped,
            rows_updated = updated,
            "location refresh complete"
        );
        Ok(outcome.stats)
    }

    fn load_postal_codes(&self) -> AppResult<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT postal_code FROM locations ORDER BY id ASC")?;
        let codes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(codes)
    }

    fn persist_resolved(&self, resolved: &[ResolvedLocation]) -> AppResult<usize> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE locations SET longitude = ?1, latitude = ?2, region = ?3
                WHERE postal_code = ?4",
            )?;
            for location in resolved {
                updated += stmt.execute((
                    location.longitude,
                    location.latitude,
                    location.region.as_deref(),
                    location.postal_code.as_str(),
                ))?;
            }
        }
        tx.execute(
            "INSERT INTO cache_info (id, locations_cached_at) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET locations_cached_at = excluded.locations_cached_at",
            [now_timestamp()],
        )?;
        tx.commit()?;
        Ok(updated)
    }

    fn read_stamp(&self, column: &str) -> AppResult<Option<DateTime<Utc>>> {
        let conn = self.db.lock();
        let sql = format!("SELECT {column} FROM cache_info WHERE id = 1");
        let raw: Option<Option<String>> = conn
            .query_row(&sql, [], |row| row.get(0))
            .optional()?;
        let Some(Some(text)) = raw else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&text) {
            Ok(parsed) => Ok(Some(parsed.with_timezone(&Utc))),
            Err(err) => {
                warn!(?err, column, stamp = %text, "unreadable cache stamp; treating as never cached");
                Ok(None)
            }
        }
    }

    fn exceeds_ttl(&self, stamp: Option<DateTime<Utc>>) -> bool {
        match stamp {
            Some(at) => Utc::now() - at > self.ttl,
            None => true,
        }
    }
}
