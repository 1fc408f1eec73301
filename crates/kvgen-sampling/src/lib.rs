//! # kvgen-sampling
//!
//! Next-token selection for the kvgen decode loop.
//!
//! A [`Sampler`] is either greedy (argmax, ties go to the lowest index) or
//! stochastic. Stochastic selection works on a candidate list:
//!
//! 1. masked (`-inf`) entries are dropped and the repetition penalty applied
//! 2. logits are divided by the temperature
//! 3. candidates are ranked, cut to `top_k` (`0` keeps all) and softmaxed
//! 4. the ranked list is cut to the nucleus of mass `top_p` (active for `0 < p < 1`)
//! 5. one candidate is drawn from a seeded [`StdRng`]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("logits are empty or contain NaN")]
    InvalidLogits,
    #[error("temperature must be > 0")]
    InvalidTemperature,
    #[error("every token is masked")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

const DEFAULT_SEED: u64 = 42;

/// Token selection strategy plus its random source.
#[derive(Debug, Clone)]
pub struct Sampler {
    greedy: bool,
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repetition_penalty: Option<f32>,
    rng: StdRng,
}

/// A token still in the running, with its current logit or probability.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: usize,
    weight: f32,
}

impl Sampler {
    /// Stochastic sampler: temperature 1, no filtering, fixed seed.
    pub fn new() -> Self {
        Self {
            greedy: false,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: None,
            rng: StdRng::seed_from_u64(DEFAULT_SEED),
        }
    }

    /// Argmax sampler; every other setting is ignored.
    pub fn greedy() -> Self {
        Self {
            greedy: true,
            ..Self::new()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    /// Positive logits of already-seen tokens are divided by `penalty`,
    /// negative ones multiplied.
    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = Some(penalty);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Seed from the thread RNG, for requests that did not ask for reproducibility.
    pub fn with_random_seed(self) -> Self {
        self.with_seed(rand::random())
    }

    pub fn is_greedy(&self) -> bool {
        self.greedy
    }

    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        self.sample_with_history(logits, &[])
    }

    /// Sample, penalizing the ids in `history` when a repetition penalty is set.
    pub fn sample_with_history(
        &mut self,
        logits: &[f32],
        history: &[usize],
    ) -> SamplingResult<usize> {
        if logits.is_empty() || logits.iter().any(|l| l.is_nan()) {
            return Err(SamplingError::InvalidLogits);
        }
        if self.greedy {
            return Self::argmax(logits)
                .filter(|&i| logits[i].is_finite())
                .ok_or(SamplingError::NoValidTokens);
        }
        if self.temperature.is_nan() || self.temperature <= 0.0 {
            return Err(SamplingError::InvalidTemperature);
        }

        let mut candidates = self.ranked_candidates(logits, history);
        if candidates.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }
        if self.top_k > 0 {
            candidates.truncate(self.top_k);
        }
        normalize(&mut candidates);
        if self.top_p > 0.0 && self.top_p < 1.0 {
            keep_nucleus(&mut candidates, self.top_p);
        }
        Ok(self.draw(&candidates))
    }

    /// Finite, penalized, temperature-scaled logits, highest first.
    fn ranked_candidates(&self, logits: &[f32], history: &[usize]) -> Vec<Candidate> {
        let mut scaled = logits.to_vec();
        if let Some(penalty) = self.repetition_penalty {
            for &id in history {
                if let Some(l) = scaled.get_mut(id) {
                    *l = if *l > 0.0 { *l / penalty } else { *l * penalty };
                }
            }
        }

        let mut candidates: Vec<Candidate> = scaled
            .into_iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(id, l)| Candidate {
                id,
                weight: l / self.temperature,
            })
            .collect();
        // Stable, so equal logits keep id order.
        candidates.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        candidates
    }

    fn draw(&mut self, candidates: &[Candidate]) -> usize {
        let total: f32 = candidates.iter().map(|c| c.weight).sum();
        let mut r = self.rng.gen::<f32>() * total;
        for c in candidates {
            if r < c.weight {
                return c.id;
            }
            r -= c.weight;
        }
        // Rounding left `r` past the end; the last candidate with mass wins.
        candidates
            .iter()
            .rev()
            .find(|c| c.weight > 0.0)
            .unwrap_or(&candidates[0])
            .id
    }

    /// Numerically stable softmax; masked (`-inf`) entries get probability 0.
    pub fn softmax(logits: &[f32]) -> Vec<f32> {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !max.is_finite() {
            return vec![1.0 / logits.len() as f32; logits.len()];
        }
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        exps.into_iter().map(|e| e / sum).collect()
    }

    /// Index of the largest value, first one on ties. NaN entries are skipped.
    pub fn argmax(values: &[f32]) -> Option<usize> {
        values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
                Some((_, b)) if v <= b => best,
                _ => Some((i, v)),
            })
            .map(|(i, _)| i)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn ranked logits into probabilities in place.
fn normalize(candidates: &mut [Candidate]) {
    let max = candidates[0].weight;
    let mut sum = 0.0;
    for c in candidates.iter_mut() {
        c.weight = (c.weight - max).exp();
        sum += c.weight;
    }
    for c in candidates.iter_mut() {
        c.weight /= sum;
    }
}

/// Keep the shortest ranked prefix whose mass reaches `p`.
fn keep_nucleus(candidates: &mut Vec<Candidate>, p: f32) {
    let mut mass = 0.0;
    let keep = candidates
        .iter()
        .position(|c| {
            mass += c.weight;
            mass >= p
        })
        .map_or(candidates.len(), |i| i + 1);
    candidates.truncate(keep);
}
