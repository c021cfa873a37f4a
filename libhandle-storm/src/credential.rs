use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::{info, warn};

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(skip_serializing)]
    pub secrets: Vec<String>,
    /// Errors since the last cooldown that put a credential into cooldown.
    pub error_threshold: u32,
    #[serde(with = "crate::types::secs")]
    pub cooldown: Duration,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("secrets", &format_args!("<{} redacted>", self.secrets.len()))
            .field("error_threshold", &self.error_threshold)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            secrets: Vec::new(),
            error_threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    Success,
    Error,
}

/// A credential handed out for one request.
#[derive(Clone)]
pub struct CredentialLease {
    pub index: usize,
    pub secret: String,
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLease")
            .field("index", &self.index)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
    pub index: usize,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub in_cooldown: bool,
}

struct Credential {
    secret: String,
    success_count: u64,
    error_count: u64,
    errors_since_cooldown: u32,
    last_used_at: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl Credential {
    fn new(secret: String) -> Self {
        Self {
            secret,
            success_count: 0,
            error_count: 0,
            errors_since_cooldown: 0,
            last_used_at: None,
            cooldown_until: None,
        }
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    fn success_ratio(&self) -> f64 {
        self.success_count as f64 / (self.success_count + self.error_count).max(1) as f64
    }
}

pub struct CredentialPool {
    credentials: Mutex<Vec<Credential>>,
    error_threshold: u32,
    cooldown: Duration,
}

impl CredentialPool {
    pub fn new(config: &PoolConfig) -> Self {
        let credentials: Vec<Credential> = config
            .secrets
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| Credential::new(s.trim().to_string()))
            .collect();

        if credentials.is_empty() {
            warn!("No credentials configured, probing unauthenticated (expect lower throughput)");
        } else {
            info!("Loaded {} credentials for rotation", credentials.len());
        }

        Self {
            credentials: Mutex::new(credentials),
            error_threshold: config.error_threshold.max(1),
            cooldown: config.cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the credential for the next request, or `None` when running unauthenticated.
    pub fn select_credential(&self) -> Option<CredentialLease> {
        let mut credentials = self.lock();
        let now = Instant::now();

        let index = match credentials.len() {
            0 => return None,
            1 => 0,
            _ => {
                let eligible = credentials
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.in_cooldown(now))
                    .max_by(|(_, a), (_, b)| better_candidate(a, b));

                match eligible {
                    Some((i, _)) => i,
                    None => {
                        // Everyone is cooling down: take whoever recovers first.
                        let i = credentials
                            .iter()
                            .enumerate()
                            .min_by_key(|(_, c)| c.cooldown_until)
                            .map(|(i, _)| i)
                            .unwrap_or(0);
                        warn!("All credentials in cooldown, using credential {} (soonest to recover)", i);
                        i
                    }
                }
            }
        };

        let credential = &mut credentials[index];
        credential.last_used_at = Some(now);
        Some(CredentialLease {
            index,
            secret: credential.secret.clone(),
        })
    }

    pub fn report_outcome(&self, index: usize, outcome: CredentialOutcome) {
        let mut credentials = self.lock();
        let pool_size = credentials.len();
        let Some(credential) = credentials.get_mut(index) else {
            return;
        };

        match outcome {
            CredentialOutcome::Success => credential.success_count += 1,
            CredentialOutcome::Error => {
                credential.error_count += 1;
                credential.errors_since_cooldown += 1;

                // With no alternative to rotate to a cooldown would only stall requests.
                if pool_size > 1 && credential.errors_since_cooldown >= self.error_threshold {
                    credential.cooldown_until = Some(Instant::now() + self.cooldown);
                    credential.errors_since_cooldown = 0;
                    warn!(
                        "Credential {} hit {} errors, cooling down for {}s",
                        index,
                        self.error_threshold,
                        self.cooldown.as_secs()
                    );
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<CredentialStats> {
        let now = Instant::now();
        self.lock()
            .iter()
            .enumerate()
            .map(|(index, c)| CredentialStats {
                index,
                success_count: c.success_count,
                error_count: c.error_count,
                success_rate: c.success_ratio(),
                in_cooldown: c.in_cooldown(now),
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Credential>> {
        self.credentials.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Higher success ratio wins; on a tie the least recently used one does.
fn better_candidate(a: &Credential, b: &Credential) -> Ordering {
    a.success_ratio()
        .partial_cmp(&b.success_ratio())
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.last_used_at.cmp(&a.last_used_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(secrets: &[&str], cooldown: Duration) -> CredentialPool {
        CredentialPool::new(&PoolConfig {
            secrets: secrets.iter().map(|s| s.to_string()).collect(),
            error_threshold: 5,
            cooldown,
        })
    }

    #[test]
    fn empty_pool_runs_unauthenticated() {
        let pool = pool(&[], Duration::from_secs(300));
        assert!(pool.is_empty());
        assert!(pool.select_credential().is_none());
    }

    #[test]
    fn single_credential_never_cools_down() {
        let pool = pool(&["only"], Duration::from_secs(300));
        for _ in 0..10 {
            pool.report_outcome(0, CredentialOutcome::Error);
        }
        assert_eq!(pool.select_credential().unwrap().index, 0);
        assert!(!pool.snapshot()[0].in_cooldown);
    }

    #[test]
    fn prefers_best_success_ratio() {
        let pool = pool(&["a", "b", "c"], Duration::from_secs(300));
        pool.report_outcome(0, CredentialOutcome::Error);
        pool.report_outcome(1, CredentialOutcome::Success);
        pool.report_outcome(2, CredentialOutcome::Success);
        pool.report_outcome(2, CredentialOutcome::Error);

        assert_eq!(pool.select_credential().unwrap().index, 1);
    }

    #[test]
    fn ties_go_to_least_recently_used() {
        let pool = pool(&["a", "b", "c"], Duration::from_secs(300));
        let first = pool.select_credential().unwrap().index;
        let second = pool.select_credential().unwrap().index;
        let third = pool.select_credential().unwrap().index;

        let mut seen = vec![first, second, third];
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn equal_ratios_rotate_through_least_recently_used() {
        let pool = pool(&["a", "b", "c"], Duration::from_secs(300));
        let mut order = Vec::new();
        for _ in 0..3 {
            let index = pool.select_credential().unwrap().index;
            pool.report_outcome(index, CredentialOutcome::Success);
            order.push(index);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(pool.snapshot().iter().all(|c| c.success_count == 1));

        for expected in order {
            let index = pool.select_credential().unwrap().index;
            assert_eq!(index, expected);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn credential_in_cooldown_is_skipped_while_alternatives_exist() {
        let pool = pool(&["a", "b"], Duration::from_secs(300));
        for _ in 0..5 {
            pool.report_outcome(0, CredentialOutcome::Error);
        }

        let stats = pool.snapshot();
        assert!(stats[0].in_cooldown);
        assert_eq!(stats[0].error_count, 5);

        for _ in 0..20 {
            let lease = pool.select_credential().unwrap();
            assert_eq!(lease.index, 1);
            pool.report_outcome(1, CredentialOutcome::Success);
        }
    }

    #[test]
    fn all_in_cooldown_falls_back_to_soonest_recovery() {
        let pool = pool(&["a", "b"], Duration::from_secs(300));
        for _ in 0..5 {
            pool.report_outcome(1, CredentialOutcome::Error);
        }
        std::thread::sleep(Duration::from_millis(5));
        for _ in 0..5 {
            pool.report_outcome(0, CredentialOutcome::Error);
        }

        assert_eq!(pool.select_credential().unwrap().index, 1);
    }

    #[test]
    fn cooldown_expires() {
        let pool = pool(&["a", "b"], Duration::from_millis(20));
        pool.report_outcome(1, CredentialOutcome::Success);
        for _ in 0..5 {
            pool.report_outcome(1, CredentialOutcome::Error);
        }
        assert_eq!(pool.select_credential().unwrap().index, 0);

        std::thread::sleep(Duration::from_millis(40));
        assert!(!pool.snapshot()[1].in_cooldown);
    }

    #[test]
    fn lease_debug_hides_secret() {
        let pool = pool(&["hunter2"], Duration::from_secs(300));
        let lease = pool.select_credential().unwrap();
        assert!(!format!("{:?}", lease).contains("hunter2"));
    }
}
