use serde::{Deserialize, Serialize};
use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    ratelimit::{self, SharedSpacing, Spacing, Waiter},
    types::{secs, EndpointSpec},
};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("No endpoints configured")]
    NoEndpoints,
    #[error("Endpoint {0} has a URL template without a {{name}} placeholder")]
    MissingPlaceholder(String),
}

/// Tuning for the per-endpoint additive-increase/additive-decrease delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    #[serde(with = "secs")]
    pub initial_delay: Duration,
    /// Delay after a rate limit is `base + step * rate_limit_count`, capped at `max_delay`.
    #[serde(with = "secs")]
    pub rate_limit_base: Duration,
    #[serde(with = "secs")]
    pub rate_limit_step: Duration,
    #[serde(with = "secs")]
    pub max_delay: Duration,
    #[serde(with = "secs")]
    pub min_delay: Duration,
    #[serde(with = "secs")]
    pub success_decrease: Duration,
    pub success_streak: u32,
    /// Consecutive transport failures that disable an endpoint.
    pub failure_threshold: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            rate_limit_base: Duration::from_millis(500),
            rate_limit_step: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            min_delay: Duration::from_millis(200),
            success_decrease: Duration::from_millis(100),
            success_streak: 10,
            failure_threshold: 5,
        }
    }
}

/// An endpoint picked for one request.
///
/// If the endpoint was not immediately ready, the request holds a place in its
/// queue and [`Routed::ready`] waits for a slot of its own.
pub struct Routed {
    pub index: usize,
    pub name: String,
    pub url_template: String,
    pending: Option<Waiter>,
}

impl Routed {
    pub async fn ready(&mut self) {
        if let Some(waiter) = self.pending.take() {
            waiter.claim().await;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn url_for(&self, candidate: &str) -> String {
        self.url_template.replace("{name}", candidate)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub name: String,
    pub enabled: bool,
    pub delay_secs: f64,
    pub rate_limit_count: u64,
    pub success_streak: u32,
    pub consecutive_failures: u32,
    /// Requests picked for this endpoint that are still waiting for their slot.
    pub queued: usize,
}

struct Endpoint {
    name: String,
    url_template: String,
    spacing: SharedSpacing,
    rate_limit_count: u64,
    success_streak: u32,
    consecutive_failures: u32,
    enabled: bool,
}

struct RouterState {
    endpoints: Vec<Endpoint>,
    last_used: Option<usize>,
}

pub struct EndpointRouter {
    state: Mutex<RouterState>,
    config: RouterConfig,
}

impl EndpointRouter {
    pub fn new(specs: &[EndpointSpec], config: RouterConfig) -> Result<Self, EndpointError> {
        if specs.is_empty() {
            return Err(EndpointError::NoEndpoints);
        }

        let endpoints = specs
            .iter()
            .map(|spec| {
                if !spec.url_template.contains("{name}") {
                    return Err(EndpointError::MissingPlaceholder(spec.name.clone()));
                }
                Ok(Endpoint {
                    name: spec.name.clone(),
                    url_template: spec.url_template.clone(),
                    spacing: Spacing::shared(config.initial_delay),
                    rate_limit_count: 0,
                    success_streak: 0,
                    consecutive_failures: 0,
                    enabled: true,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            state: Mutex::new(RouterState {
                endpoints,
                last_used: None,
            }),
            config,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the endpoint for the next request.
    ///
    /// The last-used endpoint is reused while its spacing has elapsed. Otherwise any
    /// other ready endpoint is taken, and failing that the one whose queue clears
    /// soonest, counting requests already waiting on it.
    pub fn select_endpoint(&self) -> Routed {
        self.pick(None)
    }

    /// Like [`select_endpoint`](Self::select_endpoint) but never returns `excluding`.
    ///
    /// Returns `None` when no other enabled endpoint exists.
    pub fn select_fallback(&self, excluding: usize) -> Option<Routed> {
        let state = self.lock();
        let has_alternative = state
            .endpoints
            .iter()
            .enumerate()
            .any(|(i, e)| i != excluding && e.enabled);
        drop(state);

        has_alternative.then(|| self.pick(Some(excluding)))
    }

    fn pick(&self, excluding: Option<usize>) -> Routed {
        let mut state = self.lock();
        let usable = |i: usize, e: &Endpoint| e.enabled && Some(i) != excluding;

        let mut chosen = None;
        let mut last_backlog = None;
        let mut soonest: Option<(usize, Duration)> = None;

        if let Some(last) = state.last_used {
            let endpoint = &state.endpoints[last];
            if usable(last, endpoint) {
                let spacing = ratelimit::lock(&endpoint.spacing);
                match spacing.try_claim() {
                    Ok(()) => chosen = Some(last),
                    Err(wait) => last_backlog = Some((last, spacing.backlog(wait))),
                }
            }
        }

        if chosen.is_none() {
            for (i, endpoint) in state.endpoints.iter().enumerate() {
                if Some(i) == state.last_used || !usable(i, endpoint) {
                    continue;
                }
                let spacing = ratelimit::lock(&endpoint.spacing);
                match spacing.try_claim() {
                    Ok(()) => {
                        chosen = Some(i);
                        break;
                    }
                    Err(wait) => {
                        let backlog = spacing.backlog(wait);
                        if soonest.map_or(true, |(_, best)| backlog < best) {
                            soonest = Some((i, backlog));
                        }
                    }
                }
            }
        }

        // The last-used endpoint only keeps the queue on a strictly shorter backlog.
        if let Some((last, backlog)) = last_backlog {
            if soonest.map_or(true, |(_, best)| backlog < best) {
                soonest = Some((last, backlog));
            }
        }

        let (index, pending) = match (chosen, soonest) {
            (Some(i), _) => (i, None),
            (None, Some((i, backlog))) => {
                debug!("No endpoint ready, queueing {:?} on {}", backlog, state.endpoints[i].name);
                (i, Some(Waiter::enqueue(&state.endpoints[i].spacing)))
            }
            // Only reachable if every endpoint is excluded or disabled.
            (None, None) => (0, Some(Waiter::enqueue(&state.endpoints[0].spacing))),
        };

        state.last_used = Some(index);
        let endpoint = &state.endpoints[index];

        Routed {
            index,
            name: endpoint.name.clone(),
            url_template: endpoint.url_template.clone(),
            pending,
        }
    }

    pub fn report_success(&self, index: usize) {
        let mut state = self.lock();
        let config = &self.config;
        let Some(endpoint) = state.endpoints.get_mut(index) else {
            return;
        };

        endpoint.consecutive_failures = 0;
        endpoint.success_streak += 1;
        if endpoint.success_streak >= config.success_streak {
            endpoint.success_streak = 0;
            let mut spacing = ratelimit::lock(&endpoint.spacing);
            let current = spacing.delay();
            let lowered = current
                .saturating_sub(config.success_decrease)
                .max(config.min_delay);
            if lowered != current {
                spacing.set_delay(lowered);
                debug!("Endpoint {} delay lowered to {:?}", endpoint.name, lowered);
            }
        }
    }

    pub fn report_rate_limited(&self, index: usize) {
        let mut state = self.lock();
        let config = &self.config;
        let Some(endpoint) = state.endpoints.get_mut(index) else {
            return;
        };

        endpoint.rate_limit_count += 1;
        endpoint.success_streak = 0;
        let raised = (config.rate_limit_base
            + config.rate_limit_step.mul_f64(endpoint.rate_limit_count as f64))
        .min(config.max_delay);
        ratelimit::lock(&endpoint.spacing).set_delay(raised);
        warn!(
            "Endpoint {} rate limited ({} total), delay now {:?}",
            endpoint.name, endpoint.rate_limit_count, raised
        );
    }

    pub fn report_transport_error(&self, index: usize) {
        let mut state = self.lock();
        let threshold = self.config.failure_threshold.max(1);
        let Some(endpoint) = state.endpoints.get_mut(index) else {
            return;
        };

        endpoint.success_streak = 0;
        endpoint.consecutive_failures += 1;
        if endpoint.enabled && endpoint.consecutive_failures >= threshold {
            endpoint.enabled = false;
            warn!(
                "Endpoint {} disabled after {} consecutive failures",
                endpoint.name, endpoint.consecutive_failures
            );
        }

        if state.endpoints.iter().all(|e| !e.enabled) {
            let first = &mut state.endpoints[0];
            first.enabled = true;
            first.consecutive_failures = 0;
            info!("All endpoints disabled, re-enabling {}", first.name);
        }
    }

    pub fn snapshot(&self) -> Vec<EndpointStats> {
        self.lock()
            .endpoints
            .iter()
            .map(|e| {
                let spacing = ratelimit::lock(&e.spacing);
                EndpointStats {
                    name: e.name.clone(),
                    enabled: e.enabled,
                    delay_secs: spacing.delay().as_secs_f64(),
                    rate_limit_count: e.rate_limit_count,
                    success_streak: e.success_streak,
                    consecutive_failures: e.consecutive_failures,
                    queued: spacing.queued(),
                }
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn specs(n: usize) -> Vec<EndpointSpec> {
        (0..n)
            .map(|i| EndpointSpec {
                name: format!("ep{}", i),
                url_template: format!("https://ep{}.test/validate?username={{name}}", i),
            })
            .collect()
    }

    fn router(n: usize) -> EndpointRouter {
        EndpointRouter::new(&specs(n), RouterConfig::default()).unwrap()
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(
            EndpointRouter::new(&[], RouterConfig::default()),
            Err(EndpointError::NoEndpoints)
        ));
        let broken = vec![EndpointSpec {
            name: "broken".to_string(),
            url_template: "https://x.test/validate".to_string(),
        }];
        assert!(matches!(
            EndpointRouter::new(&broken, RouterConfig::default()),
            Err(EndpointError::MissingPlaceholder(_))
        ));
    }

    #[test]
    fn url_template_substitutes_candidate() {
        let routed = router(1).select_endpoint();
        assert_eq!(
            routed.url_for("ab_c"),
            "https://ep0.test/validate?username=ab_c"
        );
    }

    #[test]
    fn busy_endpoint_hands_over_to_a_ready_one() {
        let router = router(2);
        let first = router.select_endpoint();
        assert_eq!(first.index, 0);
        assert!(first.pending.is_none());

        let second = router.select_endpoint();
        assert_eq!(second.index, 1);
        assert!(second.pending.is_none());

        // Both spaced out: the soonest one is returned with a wait attached.
        let third = router.select_endpoint();
        assert!(third.pending.is_some());
    }

    #[test]
    fn ready_last_used_endpoint_is_reused() {
        let config = RouterConfig {
            initial_delay: Duration::from_millis(10),
            ..RouterConfig::default()
        };
        let router = EndpointRouter::new(&specs(3), config).unwrap();
        assert_eq!(router.select_endpoint().index, 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(router.select_endpoint().index, 0);
    }

    #[test]
    fn rate_limits_raise_delay_up_to_cap() {
        let router = router(1);
        router.report_rate_limited(0);
        assert_eq!(router.snapshot()[0].delay_secs, 1.0);
        router.report_rate_limited(0);
        assert_eq!(router.snapshot()[0].delay_secs, 1.5);
        for _ in 0..20 {
            router.report_rate_limited(0);
        }
        assert_eq!(router.snapshot()[0].delay_secs, 5.0);
    }

    #[test]
    fn success_streak_lowers_delay_to_floor() {
        let router = router(1);
        for _ in 0..10 {
            router.report_success(0);
        }
        let stats = &router.snapshot()[0];
        assert!((stats.delay_secs - 0.4).abs() < 1e-9);
        assert_eq!(stats.success_streak, 0);

        for _ in 0..100 {
            router.report_success(0);
        }
        assert!((router.snapshot()[0].delay_secs - 0.2).abs() < 1e-9);
    }

    #[test]
    fn five_transport_errors_disable_endpoint() {
        let router = router(2);
        assert_eq!(router.select_endpoint().index, 0);
        for _ in 0..5 {
            router.report_transport_error(0);
        }
        assert!(!router.snapshot()[0].enabled);

        for _ in 0..3 {
            assert_eq!(router.select_endpoint().index, 1);
        }
    }

    #[test]
    fn success_resets_failure_count() {
        let router = router(2);
        for _ in 0..4 {
            router.report_transport_error(0);
        }
        router.report_success(0);
        router.report_transport_error(0);
        assert!(router.snapshot()[0].enabled);
    }

    #[test]
    fn at_least_one_endpoint_stays_enabled() {
        let router = router(3);
        for _ in 0..10 {
            for i in 0..3 {
                router.report_transport_error(i);
            }
            assert!(router.snapshot().iter().any(|e| e.enabled));
        }
        let stats = router.snapshot();
        assert!(stats[0].enabled);
    }

    #[test]
    fn fallback_avoids_excluded_endpoint() {
        let router = router(3);
        let first = router.select_endpoint();
        let fallback = router.select_fallback(first.index).unwrap();
        assert_ne!(fallback.index, first.index);

        let single = self::router(1);
        assert!(single.select_fallback(0).is_none());
    }

    #[test]
    fn queued_requests_alternate_between_busy_endpoints() {
        let router = router(2);
        let picks: Vec<Routed> = (0..10).map(|_| router.select_endpoint()).collect();
        let indices: Vec<usize> = picks.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);

        let stats = router.snapshot();
        assert_eq!(stats[0].queued, 4);
        assert_eq!(stats[1].queued, 4);

        drop(picks);
        assert!(router.snapshot().iter().all(|e| e.queued == 0));
    }

    #[tokio::test]
    async fn pending_endpoint_becomes_ready() {
        let config = RouterConfig {
            initial_delay: Duration::from_millis(20),
            ..RouterConfig::default()
        };
        let router = EndpointRouter::new(&specs(1), config).unwrap();
        router.select_endpoint().ready().await;
        let mut next = router.select_endpoint();
        assert!(next.is_pending());
        tokio::time::timeout(Duration::from_secs(1), next.ready())
            .await
            .unwrap();
        assert!(!next.is_pending());
        assert_eq!(router.snapshot()[0].queued, 0);
    }

    #[tokio::test]
    async fn rate_limit_slows_requests_already_queued() {
        let config = RouterConfig {
            initial_delay: Duration::from_millis(20),
            rate_limit_base: Duration::from_millis(100),
            rate_limit_step: Duration::from_millis(100),
            ..RouterConfig::default()
        };
        let router = EndpointRouter::new(&specs(1), config).unwrap();
        router.select_endpoint().ready().await;
        let queued: Vec<Routed> = (0..3).map(|_| router.select_endpoint()).collect();
        assert!(queued.iter().all(Routed::is_pending));

        let limited_at = Instant::now();
        router.report_rate_limited(0);

        let mut started = futures::future::join_all(queued.into_iter().map(|mut routed| async move {
            routed.ready().await;
            Instant::now()
        }))
        .await;
        started.sort();

        // New spacing is 200ms and applies from the rate limit on.
        let floor = Duration::from_millis(190);
        assert!(started[0].duration_since(limited_at) >= floor);
        for pair in started.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= floor);
        }
    }
}
