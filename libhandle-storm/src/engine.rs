use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::{HttpApi, NameApi},
    cache::ResultCache,
    controller::{AdaptiveController, ControllerStats},
    credential::{CredentialPool, CredentialStats},
    endpoint::{EndpointError, EndpointRouter, EndpointStats},
    generator::{CandidateGenerator, MAX_LENGTH, MIN_LENGTH},
    http::create_http_pool,
    prober::CheckPipeline,
    store::{CheckStore, StoreError},
    types::{AdaptiveParameters, CheckOutcome, ProbeConfig},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Invalid length range {min}..={max}")]
    InvalidLengthRange { min: usize, max: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub parameters: AdaptiveParameters,
    pub length_override: Option<(usize, usize)>,
    pub outcomes: ControllerStats,
    pub credentials: Vec<CredentialStats>,
    pub endpoints: Vec<EndpointStats>,
    pub cached_results: usize,
}

/// Totals for one `run` call.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunSummary {
    pub batches: u64,
    pub checked: u64,
    pub available: u64,
    pub errors: u64,
}

impl RunSummary {
    fn add(&mut self, outcome: &CheckOutcome) {
        self.checked += 1;
        if outcome.is_error {
            self.errors += 1;
        } else if outcome.is_available {
            self.available += 1;
        }
    }
}

/// Owns every component and drives the generate, check, adapt loop.
pub struct Engine {
    pipeline: CheckPipeline,
    controller: Arc<AdaptiveController>,
    credentials: Arc<CredentialPool>,
    router: Arc<EndpointRouter>,
    store: Arc<dyn CheckStore>,
    generator: Mutex<CandidateGenerator>,
    length_override: Mutex<Option<(usize, usize)>>,
    config: ProbeConfig,
}

impl Engine {
    /// Builds an engine that talks to the configured upstream over HTTP.
    pub fn new(config: ProbeConfig, store: Arc<dyn CheckStore>) -> Result<Self, EngineError> {
        let client = create_http_pool(config.timeout, &config.upstream.user_agent)?;
        let api = Arc::new(HttpApi::new(client, &config.upstream, config.timeout));
        Self::with_api(config, store, api)
    }

    pub fn with_api(
        config: ProbeConfig,
        store: Arc<dyn CheckStore>,
        api: Arc<dyn NameApi>,
    ) -> Result<Self, EngineError> {
        let router = Arc::new(EndpointRouter::new(
            &config.upstream.endpoints,
            config.router.clone(),
        )?);
        let credentials = Arc::new(CredentialPool::new(&config.credentials));
        let controller = Arc::new(AdaptiveController::new(config.controller.clone()));
        let generator = CandidateGenerator::new(config.generator.clone());

        let pipeline = CheckPipeline::new(
            Arc::clone(&router),
            Arc::clone(&credentials),
            api,
            Arc::clone(&store),
            Arc::clone(&controller),
            ResultCache::new(config.cache_ttl),
            config.upstream.available_code,
        );

        info!(
            "Engine ready: {} endpoints, {} credentials, concurrency {}",
            router.len(),
            credentials.len(),
            controller.parameters().concurrency_target
        );

        Ok(Self {
            pipeline,
            controller,
            credentials,
            router,
            store,
            generator: Mutex::new(generator),
            length_override: Mutex::new(None),
            config,
        })
    }

    pub fn current_parameters(&self) -> AdaptiveParameters {
        self.controller.parameters()
    }

    pub fn trigger_adaptation(&self) -> AdaptiveParameters {
        self.controller.recompute()
    }

    pub async fn check_single(&self, candidate: &str) -> CheckOutcome {
        self.pipeline.check(candidate).await
    }

    /// Restricts generated lengths to `min..=max`, or lifts the restriction with `None`.
    ///
    /// Parameters are recomputed from what was learned so far, then the outcome
    /// windows are cleared since they describe the old length mix.
    pub fn set_length_override(
        &self,
        range: Option<(usize, usize)>,
    ) -> Result<AdaptiveParameters, EngineError> {
        if let Some((min, max)) = range {
            if min < MIN_LENGTH || max > MAX_LENGTH || min > max {
                return Err(EngineError::InvalidLengthRange { min, max });
            }
        }

        *self
            .length_override
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = range;
        match range {
            Some((min, max)) => info!("Length override set to {}..={}", min, max),
            None => info!("Length override cleared"),
        }

        let params = self.trigger_adaptation();
        self.controller.reset();
        Ok(params)
    }

    pub fn length_override(&self) -> Option<(usize, usize)> {
        *self
            .length_override
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub async fn recently_available(&self, limit: usize) -> Result<Vec<CheckOutcome>, StoreError> {
        self.store.list_recently_available(limit).await
    }

    /// Drops store records older than the configured retention.
    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        let removed = self
            .store
            .cleanup_old_records(self.config.retention)
            .await?;
        if removed > 0 {
            info!("Removed {} stale check records", removed);
        }
        Ok(removed)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            parameters: self.controller.parameters(),
            length_override: self.length_override(),
            outcomes: self.controller.stats(),
            credentials: self.credentials.snapshot(),
            endpoints: self.router.snapshot(),
            cached_results: self.pipeline.cached_len(),
        }
    }

    /// Generates `size` distinct candidates from the current parameters.
    pub fn next_batch(&self, size: usize) -> Vec<String> {
        let params = self.controller.parameters();
        let range = self.length_override();
        let mut generator = self.generator.lock().unwrap_or_else(|e| e.into_inner());

        let mut seen = HashSet::with_capacity(size);
        // Bounded so a tiny length range cannot spin forever.
        for _ in 0..size.saturating_mul(4) {
            if seen.len() == size {
                break;
            }
            let candidate = match range {
                Some((min, max)) => generator.generate_with_length(min, max, &params),
                None => generator.generate(&params),
            };
            seen.insert(candidate);
        }
        seen.into_iter().collect()
    }

    /// Checks one batch sized by the current concurrency target.
    ///
    /// Outcomes are forwarded as they complete. Returns `false` once the receiver is gone.
    pub async fn run_batch(
        &self,
        outcomes: &mpsc::Sender<CheckOutcome>,
        summary: &mut RunSummary,
    ) -> bool {
        let purged = self.pipeline.purge_cache();
        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }

        let concurrency = self.controller.parameters().concurrency_target.max(1);
        let batch = self.next_batch(concurrency);
        debug!("Checking batch of {} candidates", batch.len());

        let mut results = stream::iter(batch)
            .map(|candidate| async move { self.pipeline.check(&candidate).await })
            .buffer_unordered(concurrency);

        let mut receiver_alive = true;
        while let Some(outcome) = results.next().await {
            summary.add(&outcome);
            if receiver_alive && outcomes.send(outcome).await.is_err() {
                receiver_alive = false;
            }
        }
        summary.batches += 1;
        receiver_alive
    }

    /// Runs batches until `shutdown` fires. The batch in flight is always finished.
    pub async fn run(
        &self,
        shutdown: CancellationToken,
        outcomes: mpsc::Sender<CheckOutcome>,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let adapt_every = u64::from(self.config.adapt_every_batches.max(1));

        while !shutdown.is_cancelled() {
            if !self.run_batch(&outcomes, &mut summary).await {
                warn!("Outcome receiver closed, stopping");
                break;
            }

            if summary.batches % adapt_every == 0 {
                self.trigger_adaptation();
            }

            let pause = self.batch_pause();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if let Err(e) = self.controller.save() {
            warn!("Failed to save adaptive state on shutdown: {}", e);
        }
        info!(
            "Run finished: {} batches, {} checked, {} available, {} errors",
            summary.batches, summary.checked, summary.available, summary.errors
        );
        summary
    }

    fn batch_pause(&self) -> Duration {
        let min = self.config.batch_pause_min;
        let max = self.config.batch_pause_max;
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{ApiError, ApiResponse},
        endpoint::RouterConfig,
        store::MemoryStore,
    };
    use async_trait::async_trait;

    /// Says every name ending in a digit is free.
    struct DigitsFree;

    #[async_trait]
    impl NameApi for DigitsFree {
        async fn validate(&self, url: &str, _: Option<&str>) -> Result<ApiResponse, ApiError> {
            let free = url.chars().last().is_some_and(|c| c.is_ascii_digit());
            Ok(ApiResponse {
                status: 200,
                code: Some(if free { 0 } else { 1 }),
                message: None,
            })
        }
    }

    fn fast_config() -> ProbeConfig {
        let mut config = ProbeConfig {
            batch_pause_min: Duration::from_millis(1),
            batch_pause_max: Duration::from_millis(2),
            ..ProbeConfig::default()
        };
        config.upstream.endpoints[0].url_template = "https://names.test/check?u={name}".to_string();
        config.router = RouterConfig {
            initial_delay: Duration::from_millis(1),
            min_delay: Duration::from_millis(1),
            ..RouterConfig::default()
        };
        config
    }

    fn engine() -> Engine {
        Engine::with_api(fast_config(), Arc::new(MemoryStore::default()), Arc::new(DigitsFree)).unwrap()
    }

    #[test]
    fn batches_are_distinct_and_valid() {
        let engine = engine();
        let batch = engine.next_batch(25);
        assert_eq!(batch.len(), 25);
        assert_eq!(batch.iter().collect::<HashSet<_>>().len(), 25);
        assert!(batch.iter().all(|c| crate::generator::validate(c)));
    }

    #[test]
    fn length_override_applies_and_validates() {
        let engine = engine();
        engine.set_length_override(Some((6, 7))).unwrap();
        assert!(engine
            .next_batch(20)
            .iter()
            .all(|c| (6..=7).contains(&c.chars().count())));

        assert!(matches!(
            engine.set_length_override(Some((2, 5))),
            Err(EngineError::InvalidLengthRange { .. })
        ));
        assert!(engine.set_length_override(Some((8, 4))).is_err());
        assert_eq!(engine.length_override(), Some((6, 7)));

        engine.set_length_override(None).unwrap();
        assert_eq!(engine.length_override(), None);
    }

    #[test]
    fn length_override_keeps_what_was_learned() {
        let engine = engine();
        for i in 0..30 {
            let outcome = if i % 5 == 0 {
                CheckOutcome::available(&format!("name{}", i), "Code: 0")
            } else {
                CheckOutcome::taken(&format!("name{}", i), "Code: 1")
            };
            engine.controller.record_outcome(&outcome);
        }
        let before = engine.current_parameters().concurrency_target;

        let params = engine.set_length_override(Some((5, 8))).unwrap();
        assert!(params.concurrency_target > before);
        assert_eq!(engine.current_parameters().concurrency_target, params.concurrency_target);
        assert!(engine.stats().outcomes.per_length.is_empty());
    }

    #[tokio::test]
    async fn expired_cache_entries_are_purged_between_batches() {
        let mut config = fast_config();
        config.cache_ttl = Duration::from_millis(20);
        let engine =
            Engine::with_api(config, Arc::new(MemoryStore::default()), Arc::new(DigitsFree)).unwrap();
        let (tx, _rx) = mpsc::channel(1024);
        let mut summary = RunSummary::default();

        assert!(engine.run_batch(&tx, &mut summary).await);
        let first = engine.stats().cached_results;
        assert!(first > 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(engine.run_batch(&tx, &mut summary).await);
        let concurrency = engine.current_parameters().concurrency_target;
        assert!(engine.stats().cached_results <= concurrency);
    }

    #[tokio::test]
    async fn check_single_classifies() {
        let engine = engine();
        assert!(engine.check_single("abc1").await.is_available);
        let taken = engine.check_single("abcd").await;
        assert!(!taken.is_available);
        assert!(!taken.is_error);
        assert_eq!(engine.recently_available(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel_and_reports() {
        let engine = Arc::new(engine());
        let (tx, mut rx) = mpsc::channel(1024);
        let shutdown = CancellationToken::new();

        let runner = {
            let engine = Arc::clone(&engine);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { engine.run(shutdown, tx).await })
        };

        let mut received = 0;
        while received < 30 {
            if rx.recv().await.is_none() {
                break;
            }
            received += 1;
        }
        shutdown.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap();

        assert!(summary.batches >= 1);
        assert!(summary.checked >= 30);
        assert_eq!(summary.errors, 0);
        // Cache hits are returned but never reach the controller.
        assert!(engine.stats().outcomes.total_checked <= summary.checked);
        assert!(engine.stats().outcomes.total_checked > 0);
    }

    #[tokio::test]
    async fn run_stops_when_receiver_drops() {
        let engine = engine();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let summary = tokio::time::timeout(
            Duration::from_secs(10),
            engine.run(CancellationToken::new(), tx),
        )
        .await
        .unwrap();
        assert_eq!(summary.batches, 1);
    }
}
