use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    api::{ApiError, ApiResponse, NameApi},
    cache::ResultCache,
    controller::AdaptiveController,
    credential::{CredentialOutcome, CredentialPool},
    endpoint::{EndpointRouter, Routed},
    generator::validate,
    store::CheckStore,
    types::{CheckOutcome, TRANSPORT_FAILURE},
};

/// Network attempts per check: the first request plus one fallback.
const MAX_ATTEMPTS: usize = 2;

/// Status code on outcomes for candidates rejected before any request.
pub const INVALID_CANDIDATE: u16 = 400;

enum Step {
    /// A definitive answer.
    Answered(CheckOutcome),
    RateLimited,
    /// No usable response; the endpoint is blamed and another one may be tried.
    Failed { status: u16, message: String },
    /// The upstream refused this request (auth and similar); not retried.
    Rejected(CheckOutcome),
}

/// Resolves one candidate: cache, cooldown store, then the network.
///
/// `check` never fails. Every problem ends up as an error outcome.
pub struct CheckPipeline {
    router: Arc<EndpointRouter>,
    credentials: Arc<CredentialPool>,
    api: Arc<dyn NameApi>,
    store: Arc<dyn CheckStore>,
    controller: Arc<AdaptiveController>,
    cache: ResultCache,
    available_code: i64,
}

impl CheckPipeline {
    pub fn new(
        router: Arc<EndpointRouter>,
        credentials: Arc<CredentialPool>,
        api: Arc<dyn NameApi>,
        store: Arc<dyn CheckStore>,
        controller: Arc<AdaptiveController>,
        cache: ResultCache,
        available_code: i64,
    ) -> Self {
        Self {
            router,
            credentials,
            api,
            store,
            controller,
            cache,
            available_code,
        }
    }

    /// Drops cached outcomes past their TTL and returns how many went.
    pub fn purge_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub async fn check(&self, candidate: &str) -> CheckOutcome {
        if !validate(candidate) {
            debug!("Rejecting invalid candidate {:?}", candidate);
            return CheckOutcome::error(candidate, INVALID_CANDIDATE, "Invalid candidate");
        }

        if let Some(hit) = self.cache.get(candidate) {
            return hit;
        }

        if let Some(stored) = self.from_store(candidate).await {
            if stored.is_definitive() {
                self.cache.insert(stored.clone());
            }
            return stored;
        }

        let outcome = self.resolve(candidate).await;
        self.record(&outcome).await;
        outcome
    }

    async fn from_store(&self, candidate: &str) -> Option<CheckOutcome> {
        match self.store.is_in_cooldown(candidate).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!("Cooldown lookup failed for {}: {}", candidate, e);
                return None;
            }
        }

        match self.store.get_status(candidate).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Status lookup failed for {}: {}", candidate, e);
                None
            }
        }
    }

    async fn resolve(&self, candidate: &str) -> CheckOutcome {
        let mut routed = self.router.select_endpoint();
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            let step = self.attempt(&mut routed, candidate).await;
            let retry_anywhere = match step {
                Step::Answered(outcome) => {
                    self.router.report_success(routed.index);
                    return outcome;
                }
                Step::Rejected(outcome) => return outcome,
                Step::RateLimited => {
                    self.router.report_rate_limited(routed.index);
                    last_error = Some(CheckOutcome::error(candidate, 429, "Rate limited"));
                    false
                }
                Step::Failed { status, message } => {
                    self.router.report_transport_error(routed.index);
                    last_error = Some(CheckOutcome::error(candidate, status, message));
                    true
                }
            };

            if attempt + 1 == MAX_ATTEMPTS {
                break;
            }
            routed = match self.router.select_fallback(routed.index) {
                Some(next) => next,
                None if retry_anywhere => self.router.select_endpoint(),
                None => break,
            };
            debug!("Retrying {} on {}", candidate, routed.name);
        }

        last_error
            .unwrap_or_else(|| CheckOutcome::error(candidate, TRANSPORT_FAILURE, "No attempt made"))
    }

    async fn attempt(&self, routed: &mut Routed, candidate: &str) -> Step {
        let lease = self.credentials.select_credential();
        routed.ready().await;

        let url = routed.url_for(candidate);
        let result = self
            .api
            .validate(&url, lease.as_ref().map(|l| l.secret.as_str()))
            .await;
        let step = self.classify(candidate, result);

        if let Some(lease) = lease {
            let outcome = match step {
                Step::Answered(_) => CredentialOutcome::Success,
                _ => CredentialOutcome::Error,
            };
            self.credentials.report_outcome(lease.index, outcome);
        }
        step
    }

    fn classify(&self, candidate: &str, result: Result<ApiResponse, ApiError>) -> Step {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                return Step::Failed {
                    status: TRANSPORT_FAILURE,
                    message: e.to_string(),
                }
            }
        };

        match response.status {
            200 => match response.code {
                Some(code) if code == self.available_code => Step::Answered(CheckOutcome::available(
                    candidate,
                    response
                        .message
                        .unwrap_or_else(|| "Username is available".to_string()),
                )),
                Some(code) => Step::Answered(CheckOutcome::taken(
                    candidate,
                    response.message.unwrap_or_else(|| format!("Code: {}", code)),
                )),
                None => Step::Failed {
                    status: TRANSPORT_FAILURE,
                    message: "Response carried no result code".to_string(),
                },
            },
            429 => Step::RateLimited,
            status @ 500..=599 => Step::Failed {
                status,
                message: format!("Upstream error {}", status),
            },
            status => Step::Rejected(CheckOutcome::error(
                candidate,
                status,
                format!("Unexpected status {}", status),
            )),
        }
    }

    async fn record(&self, outcome: &CheckOutcome) {
        if outcome.is_definitive() {
            self.cache.insert(outcome.clone());
        }

        if let Err(e) = self
            .store
            .record_check(
                &outcome.candidate,
                outcome.is_available,
                outcome.status_code,
                &outcome.message,
            )
            .await
        {
            warn!("Failed to record check for {}: {}", outcome.candidate, e);
        }

        self.controller.record_outcome(outcome);
    }
}
