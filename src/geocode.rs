use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

pub const INVALID_REGION: &str = "invalid";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocation {
    pub postal_code: String,
    pub longitude: f64,
    pub latitude: f64,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveStats {
    pub requested: usize,
    pub batches: usize,
    pub resolved: usize,
    pub via_fallback: usize,
    pub failed_batches: usize,
    pub skipped_batches: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct ResolveOutcome {
    pub resolved: Vec<ResolvedLocation>,
    pub dropped_codes: Vec<String>,
    pub stats: ResolveStats,
}

#[derive(Debug, Serialize)]
struct BulkRequest<'a> {
    postcodes: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    status: u16,
    result: Option<Vec<BulkEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkEntry {
    pub query: String,
    pub result: Option<GeocodedPostcode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodedPostcode {
    pub postcode: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub european_electoral_region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TerminatedResponse {
    status: u16,
    result: Option<TerminatedPostcode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminatedPostcode {
    pub postcode: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

#[async_trait]
pub trait PostcodeLookup: Send + Sync {
    async fn bulk_lookup(&self, codes: &[String]) -> AppResult<Vec<BulkEntry>>;
    async fn terminated_lookup(&self, code: &str) -> AppResult<Option<TerminatedPostcode>>;
}

#[derive(Clone)]
pub struct GeocodeService {
    inner: Arc<dyn PostcodeLookup>,
}

impl GeocodeService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            inner: Arc::new(HttpPostcodeClient::new(config)?),
        })
    }

    pub fn from_lookup(lookup: Arc<dyn PostcodeLookup>) -> Self {
        Self { inner: lookup }
    }

    pub async fn bulk_lookup(&self, codes: &[String]) -> AppResult<Vec<BulkEntry>> {
        self.inner.bulk_lookup(codes).await
    }

    pub async fn terminated_lookup(&self, code: &str) -> AppResult<Option<TerminatedPostcode>> {
        self.inner.terminated_lookup(code).await
    }
}

pub struct HttpPostcodeClient {
    http: reqwest::Client,
    base: String,
}

impl HttpPostcodeClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent("postcode-clusterer/0.1.0")
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base: config.api_base.clone(),
        })
    }
}

#[async_trait]
impl PostcodeLookup for HttpPostcodeClient {
    async fn bulk_lookup(&self, codes: &[String]) -> AppResult<Vec<BulkEntry>> {
        let url = format!("{}/postcodes", self.base);
        let response = self
            .http
            .post(&url)
            .json(&BulkRequest { postcodes: codes })
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        let decoded: BulkResponse = serde_json::from_str(&body)?;
        if decoded.status != 200 {
            return Err(AppError::Parse(format!(
                "bulk lookup body reported status {}",
                decoded.status
            )));
        }
        Ok(decoded.result.unwrap_or_default())
    }

    async fn terminated_lookup(&self, code: &str) -> AppResult<Option<TerminatedPostcode>> {
        let url = format!("{}/terminated_postcodes/{}", self.base, code);
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        let body = response.text().await?;
        let decoded: TerminatedResponse = serde_json::from_str(&body)?;
        if decoded.status != 200 {
            return Err(AppError::Parse(format!(
                "terminated lookup body reported status {}",
                decoded.status
            )));
        }
        Ok(decoded.result)
    }
}

pub struct GeocodeResolver {
    lookup: GeocodeService,
    workers: usize,
}

#[derive(Debug, Default)]
struct BatchYield {
    resolved: Vec<ResolvedLocation>,
    via_fallback: usize,
    dropped: Vec<String>,
}

enum WorkerYield {
    Done(BatchYield),
    Failed,
    Skipped,
}

impl GeocodeResolver {
    pub fn new(lookup: GeocodeService, workers: usize) -> Self {
        Self {
            lookup,
            workers: workers.max(1),
        }
    }

    pub async fn resolve_batch(&self, batch: &[String]) -> AppResult<Vec<ResolvedLocation>> {
        let yielded = resolve_one_batch(&self.lookup, batch).await?;
        Ok(yielded.resolved)
    }

    pub async fn resolve_batches(
        &self,
        batches: Vec<Vec<String>>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> ResolveOutcome {
        let mut stats = ResolveStats {
            requested: batches.iter().map(Vec::len).sum(),
            batches: batches.len(),
            ..ResolveStats::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(batches.len());
        for (index, batch) in batches.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let lookup = self.lookup.clone();
            let cancel = cancel_flag.clone();
            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return WorkerYield::Skipped,
                };
                if is_cancelled(&cancel) {
                    debug!(batch = index, "skipping batch after cancellation");
                    return WorkerYield::Skipped;
                }
                match resolve_one_batch(&lookup, &batch).await {
                    Ok(yielded) => {
                        debug!(
                            batch = index,
                            resolved = yielded.resolved.len(),
                            fallback = yielded.via_fallback,
                            "batch resolved"
                        );
                        WorkerYield::Done(yielded)
                    }
                    Err(err) => {
                        warn!(
                            ?err,
                            batch = index,
                            size = batch.len(),
                            "batch lookup failed; its codes yield no results"
                        );
                        WorkerYield::Failed
                    }
                }
            }));
        }

        let mut outcome = ResolveOutcome::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(WorkerYield::Done(yielded)) => {
                    stats.resolved += yielded.resolved.len();
                    stats.via_fallback += yielded.via_fallback;
                    stats.dropped += yielded.dropped.len();
                    outcome.resolved.extend(yielded.resolved);
                    outcome.dropped_codes.extend(yielded.dropped);
                }
                Ok(WorkerYield::Failed) => stats.failed_batches += 1,
                Ok(WorkerYield::Skipped) => stats.skipped_batches += 1,
                Err(err) => {
                    warn!(?err, "batch worker aborted");
                    stats.failed_batches += 1;
                }
            }
        }
        outcome.stats = stats;
        outcome
    }
}

fn is_cancelled(flag: &Option<Arc<AtomicBool>>) -> bool {
    flag.as_ref()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

async fn resolve_one_batch(lookup: &GeocodeService, batch: &[String]) -> AppResult<BatchYield> {
    let entries = lookup.bulk_lookup(batch).await?;
    let mut yielded = BatchYield::default();
    for entry in entries {
        match entry.result {
            Some(payload) => match (payload.longitude, payload.latitude) {
                (Some(longitude), Some(latitude)) => yielded.resolved.push(ResolvedLocation {
                    postal_code: entry.query,
                    longitude,
                    latitude,
                    region: payload.european_electoral_region,
                }),
                _ => {
                    warn!(code = %entry.query, "bulk result lacks coordinates; dropping");
                    yielded.dropped.push(entry.query);
                }
            },
            None => match lookup.terminated_lookup(&entry.query).await? {
                Some(payload) => match (payload.longitude, payload.latitude) {
                    (Some(longitude), Some(latitude)) => {
                        yielded.via_fallback += 1;
                        yielded.resolved.push(ResolvedLocation {
                            postal_code: entry.query,
                            longitude,
                            latitude,
                            region: Some(INVALID_REGION.to_string()),
                        });
                    }
                    _ => {
                        warn!(code = %entry.query, "terminated result lacks coordinates; dropping");
                        yielded.dropped.push(entry.query);
                    }
                },
                None => {
                    warn!(
                        code = %entry.query,
                        "postcode unknown to both live and terminated indexes; dropping"
                    );
                    yielded.dropped.push(entry.query);
                }
            },
        }
    }
    Ok(yielded)
}
