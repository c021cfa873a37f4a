//! Feedback loop that tunes concurrency and the candidate model from recent outcomes.
//!
//! Every update is exponentially smoothed with `learning_rate`, so one noisy window
//! cannot swing the outbound request volume far. The tuned parameters and the raw
//! pattern table are written to disk after each recompute and restored at start-up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    generator::{MAX_LENGTH, MIN_LENGTH, SEPARATOR},
    types::{AdaptiveParameters, CheckOutcome},
};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to access adaptive state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode or decode adaptive state: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    pub window_size: usize,
    pub length_window_size: usize,
    /// Valid outcomes needed in the window before any adaptation happens.
    pub min_samples: usize,
    pub min_length_samples: usize,
    pub learning_rate: f64,
    /// Below this success rate concurrency backs off.
    pub low_success_rate: f64,
    /// At or above this success rate (with few errors) concurrency grows.
    pub high_success_rate: f64,
    pub max_error_rate: f64,
    pub decrease_step: usize,
    pub increase_step: usize,
    pub short_length_boost: f64,
    pub medium_length_boost: f64,
    /// Where the adaptive snapshot lives; `None` keeps tuning in memory only.
    pub state_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 5,
            max_concurrency: 30,
            initial_concurrency: 10,
            window_size: 100,
            length_window_size: 50,
            min_samples: 20,
            min_length_samples: 5,
            learning_rate: 0.1,
            low_success_rate: 0.01,
            high_success_rate: 0.05,
            max_error_rate: 0.1,
            decrease_step: 2,
            increase_step: 1,
            short_length_boost: 3.0,
            medium_length_boost: 1.5,
            state_path: None,
        }
    }
}

/// On-disk form of the controller's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub concurrency_target: usize,
    pub length_weights: BTreeMap<usize, f64>,
    pub separator_probability: f64,
    pub digit_probability: f64,
    pub upper_case_probability: f64,
    #[serde(default)]
    pub pattern_table: BTreeMap<String, u64>,
    pub last_updated: DateTime<Utc>,
}

impl Snapshot {
    fn parameters(&self) -> AdaptiveParameters {
        AdaptiveParameters {
            concurrency_target: self.concurrency_target,
            length_weights: self.length_weights.clone(),
            separator_probability: self.separator_probability,
            digit_probability: self.digit_probability,
            upper_case_probability: self.upper_case_probability,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LengthStats {
    pub checks: usize,
    pub available: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub success_rate: f64,
    pub error_rate: f64,
    pub total_checked: u64,
    pub total_available: u64,
    pub total_errors: u64,
    pub per_length: BTreeMap<usize, LengthStats>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    available: bool,
    error: bool,
}

struct State {
    params: AdaptiveParameters,
    recent: VecDeque<Sample>,
    by_length: HashMap<usize, VecDeque<Sample>>,
    patterns: BTreeMap<String, u64>,
    total_checked: u64,
    total_available: u64,
    total_errors: u64,
}

pub struct AdaptiveController {
    state: Mutex<State>,
    config: ControllerConfig,
}

impl AdaptiveController {
    /// Starts from defaults, then restores the snapshot at `config.state_path` if one exists.
    pub fn new(config: ControllerConfig) -> Self {
        let params = AdaptiveParameters {
            concurrency_target: config
                .initial_concurrency
                .clamp(config.min_concurrency, config.max_concurrency.max(config.min_concurrency)),
            ..AdaptiveParameters::default()
        };

        let controller = Self {
            state: Mutex::new(State {
                params,
                recent: VecDeque::new(),
                by_length: HashMap::new(),
                patterns: BTreeMap::new(),
                total_checked: 0,
                total_available: 0,
                total_errors: 0,
            }),
            config,
        };

        if let Some(path) = controller.config.state_path.clone() {
            match controller.load_from(&path) {
                Ok(true) => info!("Restored adaptive state from {}", path.display()),
                Ok(false) => debug!("No adaptive state at {}, using defaults", path.display()),
                Err(e) => warn!("Ignoring unreadable adaptive state {}: {}", path.display(), e),
            }
        }

        controller
    }

    pub fn parameters(&self) -> AdaptiveParameters {
        self.lock().params.clone()
    }

    pub fn record_outcome(&self, outcome: &CheckOutcome) {
        let sample = Sample {
            available: outcome.is_available && !outcome.is_error,
            error: outcome.is_error,
        };
        let window = self.config.window_size.max(1);
        let length_window = self.config.length_window_size.max(1);

        let mut state = self.lock();
        push_bounded(&mut state.recent, sample, window);
        let bucket = state
            .by_length
            .entry(outcome.candidate.chars().count())
            .or_default();
        push_bounded(bucket, sample, length_window);

        state.total_checked += 1;
        if sample.error {
            state.total_errors += 1;
        }
        if sample.available {
            state.total_available += 1;
            for pattern in extract_patterns(&outcome.candidate) {
                *state.patterns.entry(pattern).or_insert(0) += 1;
            }
        }
    }

    /// Re-tunes the parameters from the current windows and persists them.
    ///
    /// Does nothing until the window holds at least `min_samples` valid outcomes.
    pub fn recompute(&self) -> AdaptiveParameters {
        let (params, snapshot) = {
            let mut state = self.lock();
            let (valid, available) = count(&state.recent);
            if valid < self.config.min_samples {
                debug!(
                    "Skipping adaptation, {} of {} valid samples",
                    valid, self.config.min_samples
                );
                return state.params.clone();
            }

            let success_rate = available as f64 / valid as f64;
            let error_rate = error_rate(&state.recent);
            info!(
                "Current success rate: {:.2}% ({}/{}), error rate {:.2}%",
                success_rate * 100.0,
                available,
                valid,
                error_rate * 100.0
            );

            self.adapt_concurrency(&mut state, success_rate, error_rate);
            self.adapt_length_weights(&mut state);
            self.adapt_character_probabilities(&mut state);

            (state.params.clone(), snapshot_of(&state))
        };

        if let Some(path) = &self.config.state_path {
            if let Err(e) = write_snapshot(path, &snapshot) {
                warn!("Failed to save adaptive state to {}: {}", path.display(), e);
            }
        }
        params
    }

    fn adapt_concurrency(&self, state: &mut State, success_rate: f64, error_rate: f64) {
        let config = &self.config;
        let current = state.params.concurrency_target;
        let target = if success_rate < config.low_success_rate {
            current.saturating_sub(config.decrease_step)
        } else if success_rate >= config.high_success_rate && error_rate < config.max_error_rate {
            current.saturating_add(config.increase_step)
        } else {
            return;
        };

        let next = smooth_toward(current, target, config.learning_rate)
            .clamp(config.min_concurrency, config.max_concurrency.max(config.min_concurrency));
        if next != current {
            info!("Adapted concurrency {} -> {}", current, next);
        }
        state.params.concurrency_target = next;
    }

    fn adapt_length_weights(&self, state: &mut State) {
        let config = &self.config;
        let rates: BTreeMap<usize, f64> = state
            .by_length
            .iter()
            .filter(|(len, samples)| {
                (MIN_LENGTH..=MAX_LENGTH).contains(*len) && samples.len() >= config.min_length_samples
            })
            .filter_map(|(len, samples)| {
                let (valid, available) = count(samples);
                (valid > 0).then(|| (*len, available as f64 / valid as f64))
            })
            .collect();

        let total: f64 = rates.values().sum();
        if total <= 0.0 {
            return;
        }

        for (len, rate) in rates {
            let boost = if len <= 4 {
                config.short_length_boost
            } else if len <= 6 {
                config.medium_length_boost
            } else {
                1.0
            };
            let observed = rate / total * 100.0 * boost;
            let weight = state
                .params
                .length_weights
                .entry(len)
                .or_insert(observed);
            *weight = blend(*weight, observed, config.learning_rate).max(0.0);
        }
        debug!("Adapted length weights: {:?}", state.params.length_weights);
    }

    fn adapt_character_probabilities(&self, state: &mut State) {
        let rate = self.config.learning_rate;
        let ratio = |feature: &str| {
            let yes = state.patterns.get(&format!("{}:true", feature)).copied().unwrap_or(0);
            let no = state.patterns.get(&format!("{}:false", feature)).copied().unwrap_or(0);
            (yes + no > 0).then(|| yes as f64 / (yes + no) as f64)
        };
        let separator = ratio("has_separator");
        let digit = ratio("has_digit");
        let upper = ratio("has_upper");

        let params = &mut state.params;
        if let Some(observed) = separator {
            params.separator_probability = blend(params.separator_probability, observed, rate);
        }
        if let Some(observed) = digit {
            params.digit_probability = blend(params.digit_probability, observed, rate);
        }
        if let Some(observed) = upper {
            params.upper_case_probability = blend(params.upper_case_probability, observed, rate);
        }
        debug!(
            "Adapted probabilities: separator={:.2}, digit={:.2}, upper={:.2}",
            params.separator_probability, params.digit_probability, params.upper_case_probability
        );
    }

    /// Clears the outcome windows; parameters and the pattern table stay.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.recent.clear();
        state.by_length.clear();
    }

    pub fn stats(&self) -> ControllerStats {
        let state = self.lock();
        let (valid, available) = count(&state.recent);
        let per_length = state
            .by_length
            .iter()
            .filter_map(|(len, samples)| {
                let (checks, available) = count(samples);
                (checks > 0).then(|| {
                    (
                        *len,
                        LengthStats {
                            checks,
                            available,
                            rate: available as f64 / checks as f64,
                        },
                    )
                })
            })
            .collect();

        ControllerStats {
            success_rate: if valid > 0 { available as f64 / valid as f64 } else { 0.0 },
            error_rate: error_rate(&state.recent),
            total_checked: state.total_checked,
            total_available: state.total_available,
            total_errors: state.total_errors,
            per_length,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        snapshot_of(&self.lock())
    }

    pub fn save(&self) -> Result<(), StateError> {
        match &self.config.state_path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), StateError> {
        write_snapshot(path, &self.snapshot())
    }

    /// Restores state from `path`. Returns `Ok(false)` if there is no file.
    pub fn load_from(&self, path: &Path) -> Result<bool, StateError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_str(&raw)?;

        let mut params = snapshot.parameters();
        params.concurrency_target = params
            .concurrency_target
            .clamp(self.config.min_concurrency, self.config.max_concurrency.max(self.config.min_concurrency));
        params
            .length_weights
            .retain(|_, w| w.is_finite() && *w >= 0.0);
        params.separator_probability = unit(params.separator_probability);
        params.digit_probability = unit(params.digit_probability);
        params.upper_case_probability = unit(params.upper_case_probability);

        let mut state = self.lock();
        state.params = params;
        state.patterns = snapshot.pattern_table;
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn push_bounded(window: &mut VecDeque<Sample>, sample: Sample, capacity: usize) {
    window.push_back(sample);
    while window.len() > capacity {
        window.pop_front();
    }
}

/// Returns `(valid, available)` where valid excludes errors.
fn count(samples: &VecDeque<Sample>) -> (usize, usize) {
    samples
        .iter()
        .filter(|s| !s.error)
        .fold((0, 0), |(valid, available), s| {
            (valid + 1, available + usize::from(s.available))
        })
}

fn error_rate(samples: &VecDeque<Sample>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().filter(|s| s.error).count() as f64 / samples.len() as f64
}

/// One smoothed step from `current` toward `target`, moving at least one unit.
///
/// Plain rounding of `current + rate * (target - current)` would never move an
/// integer target by a step of one.
fn smooth_toward(current: usize, target: usize, rate: f64) -> usize {
    let step = (target as f64 - current as f64) * rate;
    let next = current as f64 + step;
    if step > 0.0 {
        next.ceil() as usize
    } else if step < 0.0 {
        next.floor().max(0.0) as usize
    } else {
        current
    }
}

fn blend(current: f64, observed: f64, rate: f64) -> f64 {
    (1.0 - rate) * current + rate * observed
}

fn unit(p: f64) -> f64 {
    if p.is_finite() {
        p.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn extract_patterns(candidate: &str) -> Vec<String> {
    let signature: String = candidate
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() {
                'U'
            } else if c.is_ascii_lowercase() {
                'L'
            } else if c.is_ascii_digit() {
                'N'
            } else {
                '_'
            }
        })
        .collect();

    let mut patterns = vec![format!("type:{}", signature)];
    if let Some(pos) = candidate.find(SEPARATOR) {
        patterns.push(format!("separator_pos:{}", pos));
    }
    patterns.push(format!("has_separator:{}", candidate.contains(SEPARATOR)));
    patterns.push(format!(
        "has_digit:{}",
        candidate.chars().any(|c| c.is_ascii_digit())
    ));
    patterns.push(format!(
        "has_upper:{}",
        candidate.chars().any(|c| c.is_ascii_uppercase())
    ));
    patterns.push(format!("length:{}", candidate.chars().count()));
    patterns
}

fn snapshot_of(state: &State) -> Snapshot {
    let params = &state.params;
    Snapshot {
        concurrency_target: params.concurrency_target,
        length_weights: params.length_weights.clone(),
        separator_probability: params.separator_probability,
        digit_probability: params.digit_probability,
        upper_case_probability: params.upper_case_probability,
        pattern_table: state.patterns.clone(),
        last_updated: Utc::now(),
    }
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StateError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    debug!("Saved adaptive state to {}", path.display());
    Ok(())
}
