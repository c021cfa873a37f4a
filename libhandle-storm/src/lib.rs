mod api;
mod cache;
mod controller;
mod credential;
mod endpoint;
mod engine;
mod generator;
mod http;
mod prober;
mod ratelimit;
mod store;
mod types;

pub use api::{ApiError, ApiResponse, HttpApi, NameApi};
pub use cache::ResultCache;
pub use controller::{AdaptiveController, ControllerConfig, ControllerStats, LengthStats, Snapshot, StateError};
pub use credential::{CredentialLease, CredentialOutcome, CredentialPool, CredentialStats, PoolConfig};
pub use endpoint::{EndpointError, EndpointRouter, EndpointStats, RouterConfig, Routed};
pub use engine::{Engine, EngineError, EngineStats, RunSummary};
pub use generator::{validate, CandidateGenerator, GeneratorConfig, MAX_LENGTH, MIN_LENGTH, SEPARATOR};
pub use http::create_http_pool;
pub use prober::{CheckPipeline, INVALID_CANDIDATE};
pub use store::{CheckStore, CooldownPolicy, MemoryStore, SqliteStore, StoreError};
pub use types::{
    default_length_weights, AdaptiveParameters, CheckOutcome, EndpointSpec, ProbeConfig,
    UpstreamConfig, TRANSPORT_FAILURE,
};

use std::sync::Arc;

/// One-off check with default settings, no credentials and no persistence.
pub async fn check(candidate: &str) -> Result<CheckOutcome, EngineError> {
    let engine = Engine::new(ProbeConfig::default(), Arc::new(MemoryStore::default()))?;
    Ok(engine.check_single(candidate).await)
}

/// Checks several candidates with one engine, in order.
pub async fn check_many<I>(candidates: I) -> Result<Vec<CheckOutcome>, EngineError>
where
    I: IntoIterator<Item = String>,
{
    let engine = Engine::new(ProbeConfig::default(), Arc::new(MemoryStore::default()))?;
    let mut outcomes = Vec::new();
    for candidate in candidates {
        outcomes.push(engine.check_single(&candidate).await);
    }
    Ok(outcomes)
}
