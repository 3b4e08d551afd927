//! Wires every stage together and owns the lifecycle of a single run.
//!
//! `PipelineOrchestrator` is the only component that advances the run state
//! machine (`idle → discovering → validating → fetching → deduping →
//! testing? → scoring → writing → done|failed`); every other component is a
//! stateless (or per-source-stateful) worker it calls into.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::dedup::Deduplicator;
use crate::discovery::SourceDiscovery;
use crate::error::AppResult;
use crate::event_bus::EventBus;
use crate::fetcher::{FetchRequest, Fetcher, DEFAULT_SOURCE_SIZE_CAP};
use crate::models::{ConfigResult, Event, EventType, RunRecord, RunStatus, SemanticHash, StageDurations, Tier};
use crate::output::{OutputManifest, OutputRequest, write_outputs};
use crate::protocol;
use crate::scorer::QualityScorer;
use crate::source_store::SourceStateStore;
use crate::source_validator::SourceValidator;
use crate::tester::ConnectionTester;

/// How long a fetched source body stays in the cache before a normal
/// (non-`force_refresh`) run will re-fetch it.
const FETCH_CACHE_TTL: Duration = Duration::from_secs(900);

/// In-flight run state; the happy-path traversal is linear, but any stage
/// can bail straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Discovering,
    Validating,
    Fetching,
    Deduping,
    Testing,
    Scoring,
    Writing,
    Done,
    Failed,
}

/// Per-URL override read from `sources.yaml`'s optional per-source block.
#[derive(Debug, Clone, Default)]
pub struct SourceOverride {
    pub weight: Option<f64>,
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub discovery_cap: usize,
    pub fetch_cap: usize,
    pub test_cap: Option<usize>,
    pub wall_clock_cap: Option<Duration>,
    pub min_source_score: f64,
    pub source_overrides: HashMap<String, SourceOverride>,
    pub concurrent_fetches: usize,
    pub fetch_timeout: Duration,
    pub validate_timeout: Duration,
    pub validate_concurrency: usize,
    pub max_ping_ms: u64,
    pub run_tester: bool,
    pub force_refresh: bool,
    /// Maximum accepted body size per fetched source, in bytes.
    pub max_body_bytes: usize,
    /// Skip all real network I/O (fetch probes, validation probes,
    /// reachability tests); serve fetches from cache only. Used by CI /
    /// offline runs via `SKIP_NETWORK`.
    pub skip_network: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            discovery_cap: 200,
            fetch_cap: 200,
            test_cap: None,
            wall_clock_cap: None,
            min_source_score: 0.0,
            source_overrides: HashMap::new(),
            concurrent_fetches: 50,
            fetch_timeout: Duration::from_secs(12),
            validate_timeout: Duration::from_secs(10),
            validate_concurrency: 20,
            max_ping_ms: 5000,
            run_tester: true,
            force_refresh: false,
            max_body_bytes: DEFAULT_SOURCE_SIZE_CAP,
            skip_network: false,
        }
    }
}

/// Owns exactly one run end to end.
pub struct PipelineOrchestrator {
    discovery: SourceDiscovery,
    validator: Arc<SourceValidator>,
    fetcher: Arc<Fetcher>,
    store: Arc<SourceStateStore>,
    scorer: Arc<dyn QualityScorer>,
    tester: Arc<ConnectionTester>,
    events: EventBus,
    cache: Cache,
    stage: tokio::sync::RwLock<RunStage>,
}

impl PipelineOrchestrator {
    pub fn new(
        discovery: SourceDiscovery,
        validator: Arc<SourceValidator>,
        fetcher: Arc<Fetcher>,
        store: Arc<SourceStateStore>,
        scorer: Arc<dyn QualityScorer>,
        tester: Arc<ConnectionTester>,
        events: EventBus,
        cache: Cache,
    ) -> Self {
        Self {
            discovery,
            validator,
            fetcher,
            store,
            scorer,
            tester,
            events,
            cache,
            stage: tokio::sync::RwLock::new(RunStage::Idle),
        }
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub async fn stage(&self) -> RunStage {
        *self.stage.read().await
    }

    async fn set_stage(&self, stage: RunStage) {
        *self.stage.write().await = stage;
    }

    fn emit(&self, run_id: Uuid, event_type: EventType, data: serde_json::Value) {
        self.events.publish(Event::new(event_type, data, run_id));
    }

    fn wall_clock_exceeded(started_at: Instant, cap: Option<Duration>) -> bool {
        cap.is_some_and(|c| started_at.elapsed() >= c)
    }

    /// Run the full pipeline once, writing outputs via `output_req`.
    ///
    /// Per-source failures never abort the run; only infrastructure
    /// failures (output directory unwritable, raw file write failure)
    /// surface as `Err`. A cancellation mid-run still flushes whatever was
    /// accumulated, tagging the resulting `RunRecord` as `Cancelled`.
    #[instrument(skip(self, cfg, output_req, cancel), fields(run_id = %run_id))]
    pub async fn run(
        &self,
        run_id: Uuid,
        cfg: &OrchestratorConfig,
        output_req: &OutputRequest,
        cancel: &CancellationToken,
    ) -> AppResult<RunRecord> {
        let started_at = Instant::now();
        let mut durations = StageDurations::default();
        self.emit(run_id, EventType::RunStart, json!({}));

        self.set_stage(RunStage::Discovering).await;
        let discover_start = Instant::now();
        let discovered = self.discover_stage(run_id, cfg, cancel).await;
        durations.discover_s = discover_start.elapsed().as_secs_f64();
        if cancel.is_cancelled() {
            self.set_stage(RunStage::Failed).await;
            return self.finish_cancelled(run_id, started_at, durations, output_req, &[], 0).await;
        }

        self.set_stage(RunStage::Validating).await;
        let validate_start = Instant::now();
        let selected = self.validate_and_select_stage(run_id, cfg, &discovered, cancel).await;
        durations.validate_s = validate_start.elapsed().as_secs_f64();
        if cancel.is_cancelled() {
            self.set_stage(RunStage::Failed).await;
            return self
                .finish_cancelled(run_id, started_at, durations, output_req, &[], selected.len())
                .await;
        }

        if Self::wall_clock_exceeded(started_at, cfg.wall_clock_cap) {
            warn!("wall-clock budget exhausted before fetch stage, writing empty result set");
            self.set_stage(RunStage::Writing).await;
            let write_start = Instant::now();
            return self
                .finish_writing(run_id, started_at, write_start, durations, output_req, Vec::new(), selected.len())
                .await;
        }

        self.set_stage(RunStage::Fetching).await;
        let fetch_start = Instant::now();
        let results = self.fetch_and_parse_stage(run_id, cfg, &selected, cancel).await;
        durations.fetch_s = fetch_start.elapsed().as_secs_f64();
        if cancel.is_cancelled() {
            self.set_stage(RunStage::Failed).await;
            return self
                .finish_cancelled(run_id, started_at, durations, output_req, &results, selected.len())
                .await;
        }

        self.set_stage(RunStage::Deduping).await;
        let deduped = self.dedup_stage(run_id, results);

        let tested = if cfg.run_tester && !cfg.skip_network && !cancel.is_cancelled() {
            self.set_stage(RunStage::Testing).await;
            self.test_stage(run_id, cfg, deduped, cancel).await
        } else {
            deduped
        };

        self.set_stage(RunStage::Scoring).await;
        let scored = self.score_stage(run_id, tested);

        self.set_stage(RunStage::Writing).await;
        let write_start = Instant::now();
        let record = self
            .finish_writing(run_id, started_at, write_start, durations, output_req, scored, selected.len())
            .await;
        self.set_stage(if record.is_ok() { RunStage::Done } else { RunStage::Failed })
            .await;
        record
    }

    async fn discover_stage(
        &self,
        run_id: Uuid,
        cfg: &OrchestratorConfig,
        cancel: &CancellationToken,
    ) -> Vec<String> {
        self.emit(run_id, EventType::DiscoverStart, json!({}));
        if cancel.is_cancelled() {
            return Vec::new();
        }
        let discovered = self.discovery.discover(cfg.discovery_cap, None).await;
        self.emit(
            run_id,
            EventType::DiscoverDone,
            json!({ "count": discovered.len() }),
        );
        discovered
    }

    /// Apply per-URL overrides, drop below `min_source_score`, multiply by
    /// weight, sort descending. An empty result falls back to the raw
    /// discovered set so a misconfigured threshold never zeroes out a run.
    async fn validate_and_select_stage(
        &self,
        run_id: Uuid,
        cfg: &OrchestratorConfig,
        discovered: &[String],
        cancel: &CancellationToken,
    ) -> Vec<String> {
        self.emit(run_id, EventType::ValidateStart, json!({}));

        for url in discovered {
            if self.store.get(url).await.is_none() {
                if let Err(e) = self.store.add_atomic(url, Tier::Experimental, 0.5).await {
                    warn!(url, error = %e, "failed to register newly discovered source");
                }
            }
        }

        let (mut scored, probed): (Vec<(String, f64)>, usize) = if cfg.skip_network {
            // Offline run: trust persisted source health instead of
            // probing each URL over the network.
            let mut scored = Vec::new();
            for url in discovered {
                let Some(meta) = self.store.get(url).await else {
                    continue;
                };
                if meta.is_blacklisted {
                    continue;
                }
                let override_ = cfg.source_overrides.get(url);
                let min_score = override_
                    .and_then(|o| o.min_score)
                    .unwrap_or(cfg.min_source_score);
                if meta.reputation_score < min_score {
                    continue;
                }
                let weight = override_.and_then(|o| o.weight).unwrap_or(meta.weight);
                scored.push((url.clone(), meta.reputation_score * weight));
            }
            (scored, 0)
        } else {
            let healths = self
                .validator
                .validate_many(discovered, cfg.validate_timeout, cfg.validate_concurrency, cancel)
                .await;

            let mut scored: Vec<(String, f64)> = Vec::new();
            for health in &healths {
                if let Err(e) = self
                    .store
                    .record_check(
                        &health.url,
                        health.accessible,
                        health.response_time_s.unwrap_or(0.0),
                        health.estimated_configs as u64,
                    )
                    .await
                {
                    warn!(url = %health.url, error = %e, "failed to persist source check outcome");
                }

                let meta = self.store.get(&health.url).await;
                if meta.as_ref().is_some_and(|m| m.is_blacklisted) {
                    continue;
                }

                let override_ = cfg.source_overrides.get(&health.url);
                let min_score = override_
                    .and_then(|o| o.min_score)
                    .unwrap_or(cfg.min_source_score);
                if health.reliability_score < min_score {
                    continue;
                }
                let weight = override_
                    .and_then(|o| o.weight)
                    .unwrap_or_else(|| meta.map(|m| m.weight).unwrap_or(1.0));
                scored.push((health.url.clone(), health.reliability_score * weight));
            }
            let probed = healths.len();
            (scored, probed)
        };

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let selected: Vec<String> = scored.into_iter().map(|(url, _)| url).collect();

        let selected = if selected.is_empty() {
            discovered.to_vec()
        } else {
            selected
        };
        let selected: Vec<String> = selected.into_iter().take(cfg.fetch_cap).collect();

        self.emit(
            run_id,
            EventType::ValidateDone,
            json!({ "selected": selected.len(), "probed": probed }),
        );
        selected
    }

    async fn fetch_and_parse_stage(
        &self,
        run_id: Uuid,
        cfg: &OrchestratorConfig,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> Vec<ConfigResult> {
        self.emit(run_id, EventType::FetchStart, json!({ "sources": urls.len() }));

        let semaphore = Arc::new(Semaphore::new(cfg.concurrent_fetches.max(1)));
        let mut tasks = tokio::task::JoinSet::new();

        for url in urls {
            let url = url.clone();
            let fetcher = self.fetcher.clone();
            let cache = self.cache.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let timeout = cfg.fetch_timeout;
            let max_body_bytes = cfg.max_body_bytes;
            let force_refresh = cfg.force_refresh;
            let skip_network = cfg.skip_network;
            let store = self.store.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                if store.get(&url).await.is_some_and(|m| m.is_blacklisted) {
                    return (url, None);
                }

                // `force_refresh` ignores cached source bodies entirely; a
                // normal run serves a fresh-enough cache entry without
                // touching the network at all.
                if !force_refresh {
                    if let Some(cached) = cache.get(&url, true).await {
                        return (url, Some(String::from_utf8_lossy(&cached).into_owned()));
                    }
                }

                if skip_network {
                    return (url, None);
                }

                let mut req = FetchRequest::new(&url);
                req.timeout = timeout;
                req.max_body_bytes = max_body_bytes;
                match fetcher.fetch(&req, &cancel).await {
                    Ok(body) => {
                        cache
                            .set(url.clone(), body.clone().into_bytes(), FETCH_CACHE_TTL, Vec::new())
                            .await;
                        (url, Some(body))
                    }
                    Err(e) => {
                        warn!(url, error = %e, "source fetch failed");
                        (url, None)
                    }
                }
            });
        }

        let mut results = Vec::new();
        let mut completed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let Ok((url, body)) = joined else {
                warn!("fetch task panicked");
                continue;
            };
            completed += 1;
            self.emit(
                run_id,
                EventType::FetchProgress,
                json!({ "completed": completed, "total": urls.len() }),
            );
            let Some(body) = body else { continue };
            for line in body.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some(result) = self.parse_line(run_id, line, &url) {
                    results.push(result);
                }
            }
        }

        self.emit(run_id, EventType::FetchDone, json!({ "configs": results.len() }));
        results
    }

    fn parse_line(&self, run_id: Uuid, line: &str, source_url: &str) -> Option<ConfigResult> {
        let protocol = protocol::categorize(line)?;
        if !protocol::is_valid_config(line) {
            return None;
        }
        let endpoint = protocol::extract_endpoint(line);
        let hash = protocol::semantic_hash(line);
        let (Ok(hash), endpoint) = (hash, endpoint) else {
            self.emit(
                run_id,
                EventType::InvalidHostSkipped,
                json!({ "source": source_url }),
            );
            return None;
        };
        let (host, port) = match endpoint {
            Ok((h, p)) => (Some(h), Some(p)),
            Err(_) => (None, None),
        };
        Some(ConfigResult::new(line, protocol, host, port, source_url, hash))
    }

    fn dedup_stage(&self, run_id: Uuid, results: Vec<ConfigResult>) -> Vec<ConfigResult> {
        let before = results.len();
        let mut dedup = Deduplicator::new(Default::default(), before.max(1024));
        let deduped = dedup.deduplicate(results);
        self.emit(
            run_id,
            EventType::DedupDone,
            json!({ "before": before, "after": deduped.len() }),
        );
        deduped
    }

    async fn test_stage(
        &self,
        _run_id: Uuid,
        cfg: &OrchestratorConfig,
        mut results: Vec<ConfigResult>,
        cancel: &CancellationToken,
    ) -> Vec<ConfigResult> {
        if let Some(cap) = cfg.test_cap {
            results.truncate(cap);
        }
        let mut tasks = tokio::task::JoinSet::new();
        let tester = self.tester.clone();
        let max_ping_ms = cfg.max_ping_ms;

        for (idx, mut result) in results.into_iter().enumerate() {
            let tester = tester.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                tester.test_result(&mut result, max_ping_ms, &cancel).await;
                (idx, result)
            });
        }

        let mut tested: Vec<(usize, ConfigResult)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(pair) = joined {
                tested.push(pair);
            }
        }
        tested.sort_by_key(|(idx, _)| *idx);
        tested.into_iter().map(|(_, r)| r).collect()
    }

    fn score_stage(&self, run_id: Uuid, mut results: Vec<ConfigResult>) -> Vec<ConfigResult> {
        for result in &mut results {
            result.quality_score = Some(self.scorer.score_line(&result.raw_config));
        }
        results.sort_by(|a, b| {
            b.quality_score
                .partial_cmp(&a.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let reachable = results.iter().filter(|r| r.is_reachable).count();
        self.emit(
            run_id,
            EventType::TestCompleted,
            json!({ "total": results.len(), "reachable": reachable }),
        );
        results
    }

    async fn finish_writing(
        &self,
        run_id: Uuid,
        started_at: Instant,
        write_start: Instant,
        durations: StageDurations,
        output_req: &OutputRequest,
        results: Vec<ConfigResult>,
        sources_considered: usize,
    ) -> AppResult<RunRecord> {
        let reachable = results.iter().filter(|r| r.is_reachable).count();
        let stats = json!({
            "total_configs": results.len(),
            "reachable": reachable,
            "sources_considered": sources_considered,
        });

        let manifest = write_outputs(&results, stats, started_at, sources_considered, output_req).await?;
        self.emit(
            run_id,
            EventType::OutputWritten,
            json!({ "files": manifest.written.len() }),
        );

        let mut total_durations = durations;
        total_durations.output_s = write_start.elapsed().as_secs_f64();
        total_durations.total_s = started_at.elapsed().as_secs_f64();

        let record = RunRecord {
            run_id,
            ts: Utc::now(),
            total_configs: results.len(),
            reachable,
            sources: sources_considered,
            durations: total_durations,
            status: RunStatus::Done,
        };
        self.emit(run_id, EventType::RunDone, json!({ "status": "done" }));
        Ok(record)
    }

    async fn finish_cancelled(
        &self,
        run_id: Uuid,
        started_at: Instant,
        mut durations: StageDurations,
        output_req: &OutputRequest,
        partial: &[ConfigResult],
        sources_considered: usize,
    ) -> AppResult<RunRecord> {
        warn!("run cancelled, flushing partial results");
        let stats = json!({
            "total_configs": partial.len(),
            "sources_considered": sources_considered,
            "cancelled": true,
        });
        let manifest: AppResult<OutputManifest> =
            write_outputs(partial, stats, started_at, sources_considered, output_req).await;
        if let Err(e) = &manifest {
            warn!(error = %e, "failed to flush partial results on cancellation");
        }

        durations.total_s = started_at.elapsed().as_secs_f64();
        self.emit(run_id, EventType::RunDone, json!({ "status": "cancelled" }));
        Ok(RunRecord {
            run_id,
            ts: Utc::now(),
            total_configs: partial.len(),
            reachable: partial.iter().filter(|r| r.is_reachable).count(),
            sources: sources_considered,
            durations,
            status: RunStatus::Cancelled,
        })
    }
}

/// Returns the count of distinct semantic hashes, used by callers that
/// want to verify the idempotence property (same inputs ⇒ same hash set)
/// across two runs without keeping the full result sets around.
pub fn hash_set(results: &[ConfigResult]) -> HashSet<SemanticHash> {
    results.iter().map(|r| r.semantic_hash).collect()
}
