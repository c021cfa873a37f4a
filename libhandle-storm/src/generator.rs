//! Candidate generation.
//!
//! Candidates are built from the adaptive controller's probability model. Every
//! emitted candidate satisfies [`validate`]:
//!
//! - 3 to 20 characters
//! - ASCII letters and digits, plus at most one separator (`_`)
//! - the separator is never the first or last character
//! - not made of digits only once the separator is removed

use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    Rng, SeedableRng,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

use crate::types::AdaptiveParameters;

pub const MIN_LENGTH: usize = 3;
pub const MAX_LENGTH: usize = 20;
pub const SEPARATOR: char = '_';

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// How many recent candidates are remembered to avoid immediate repeats.
    pub recent_capacity: usize,
    pub max_attempts: u32,
    /// Multiplier on the separator probability for lengths of four or less.
    pub short_separator_boost: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            recent_capacity: 10_000,
            max_attempts: 12,
            short_separator_boost: 2.0,
        }
    }
}

pub fn validate(candidate: &str) -> bool {
    let len = candidate.len();
    if !candidate.is_ascii() || !(MIN_LENGTH..=MAX_LENGTH).contains(&len) {
        return false;
    }
    if !candidate
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == SEPARATOR)
    {
        return false;
    }
    if candidate.matches(SEPARATOR).count() > 1
        || candidate.starts_with(SEPARATOR)
        || candidate.ends_with(SEPARATOR)
    {
        return false;
    }
    !candidate
        .chars()
        .filter(|&c| c != SEPARATOR)
        .all(|c| c.is_ascii_digit())
}

pub struct CandidateGenerator {
    rng: StdRng,
    recent: VecDeque<String>,
    recent_set: HashSet<String>,
    config: GeneratorConfig,
}

impl CandidateGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: GeneratorConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: GeneratorConfig, rng: StdRng) -> Self {
        Self {
            rng,
            recent: VecDeque::new(),
            recent_set: HashSet::new(),
            config,
        }
    }

    /// Generates a candidate with a length drawn from the parameters' length weights.
    pub fn generate(&mut self, params: &AdaptiveParameters) -> String {
        let weighted: Vec<(usize, f64)> = params
            .length_weights
            .iter()
            .filter(|(len, w)| (MIN_LENGTH..=MAX_LENGTH).contains(*len) && w.is_finite() && **w > 0.0)
            .map(|(len, w)| (*len, *w))
            .collect();

        let sampler = WeightedIndex::new(weighted.iter().map(|(_, w)| *w)).ok();
        self.generate_unique(params, MIN_LENGTH, |rng| match &sampler {
            Some(dist) => weighted[dist.sample(rng)].0,
            None => rng.gen_range(MIN_LENGTH..=MAX_LENGTH.min(9)),
        })
    }

    /// Generates a candidate with a length drawn uniformly from `[min, max]`,
    /// clamped to the valid range. Used for operator overrides.
    pub fn generate_with_length(
        &mut self,
        min: usize,
        max: usize,
        params: &AdaptiveParameters,
    ) -> String {
        let lo = min.clamp(MIN_LENGTH, MAX_LENGTH);
        let hi = max.clamp(lo, MAX_LENGTH);
        self.generate_unique(params, lo, |rng| rng.gen_range(lo..=hi))
    }

    fn generate_unique<F>(
        &mut self,
        params: &AdaptiveParameters,
        fallback_length: usize,
        mut pick_length: F,
    ) -> String
    where
        F: FnMut(&mut StdRng) -> usize,
    {
        for _ in 0..self.config.max_attempts.max(1) {
            let length = pick_length(&mut self.rng);
            let candidate = self.synthesize(length, params);
            if validate(&candidate) && !self.recent_set.contains(&candidate) {
                self.remember(&candidate);
                return candidate;
            }
        }

        let fallback = self.fallback(fallback_length);
        debug!("Generation retries exhausted, using fallback {}", fallback);
        self.remember(&fallback);
        fallback
    }

    fn synthesize(&mut self, length: usize, params: &AdaptiveParameters) -> String {
        let mut separator_probability = params.separator_probability;
        if length <= 4 {
            separator_probability *= self.config.short_separator_boost;
        }
        let separator_at = if self.rng.gen_bool(clamp_probability(separator_probability)) {
            Some(self.rng.gen_range(1..length - 1))
        } else {
            None
        };

        let digit = clamp_probability(params.digit_probability);
        let upper = clamp_probability(params.upper_case_probability);

        let mut chars: Vec<u8> = (0..length)
            .map(|i| {
                if Some(i) == separator_at {
                    SEPARATOR as u8
                } else if self.rng.gen_bool(digit) {
                    self.pick(DIGITS)
                } else if self.rng.gen_bool(upper) {
                    self.pick(UPPERCASE)
                } else {
                    self.pick(LOWERCASE)
                }
            })
            .collect();

        repair(&mut chars);
        String::from_utf8(chars).unwrap_or_default()
    }

    fn pick(&mut self, alphabet: &[u8]) -> u8 {
        alphabet[self.rng.gen_range(0..alphabet.len())]
    }

    /// Lowercase letters only, so always valid.
    fn fallback(&mut self, length: usize) -> String {
        (0..length).map(|_| self.pick(LOWERCASE) as char).collect()
    }

    fn remember(&mut self, candidate: &str) {
        if self.config.recent_capacity == 0 {
            return;
        }
        if self.recent_set.insert(candidate.to_string()) {
            self.recent.push_back(candidate.to_string());
        }
        while self.recent.len() > self.config.recent_capacity {
            if let Some(oldest) = self.recent.pop_front() {
                self.recent_set.remove(&oldest);
            }
        }
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }
}

/// Fixes an edge separator and an all-digit body in place.
fn repair(chars: &mut [u8]) {
    let sep = SEPARATOR as u8;
    let last = chars.len() - 1;
    if chars[0] == sep {
        chars.swap(0, 1);
    }
    if chars[last] == sep {
        chars.swap(last, last - 1);
    }

    if chars.iter().filter(|&&c| c != sep).all(u8::is_ascii_digit) {
        if let Some(slot) = chars.iter_mut().find(|c| **c != sep) {
            *slot = LOWERCASE[(*slot - b'0') as usize];
        }
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_finite() {
        p.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
