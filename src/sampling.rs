use std::collections::{BTreeSet, HashMap};

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Deserializer, de};

use crate::error::ServiceError;

/// Sampler settings accepted by `/api/generate`. Every field is optional on
/// the wire and falls back to the default listed here. Ranges are not
/// checked; the engine decides what is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    pub token_repetition_penalty: f32,
    /// Window of past tokens the penalties look at; negative means all.
    pub token_repetition_range: i64,
    #[serde(deserialize_with = "count")]
    pub token_repetition_decay: u32,
    pub token_frequency_penalty: f32,
    pub token_presence_penalty: f32,
    pub temperature: f32,
    pub smoothing_factor: f32,
    pub min_temp: f32,
    pub max_temp: f32,
    pub temp_exponent: f32,
    #[serde(deserialize_with = "count")]
    pub top_k: u32,
    pub top_p: f32,
    pub top_a: f32,
    pub min_p: f32,
    pub tfs: f32,
    pub typical: f32,
    pub skew: f32,
    pub temperature_last: bool,
    pub mirostat: bool,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub mirostat_mu: Option<f32>,
    pub cfg_scale: Option<f32>,
    #[serde(deserialize_with = "count")]
    pub dry_allowed_length: u32,
    pub dry_base: f32,
    pub dry_multiplier: f32,
    #[serde(deserialize_with = "count")]
    pub dry_range: u32,
    #[serde(deserialize_with = "count")]
    pub dry_max_ngram: u32,
    #[serde(deserialize_with = "count")]
    pub ngram_index: u32,
    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    pub xtc_ignore_tokens: Option<BTreeSet<u32>>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            token_repetition_penalty: 1.025,
            token_repetition_range: -1,
            token_repetition_decay: 0,
            token_frequency_penalty: 0.0,
            token_presence_penalty: 0.0,
            temperature: 0.8,
            smoothing_factor: 0.0,
            min_temp: 0.0,
            max_temp: 0.0,
            temp_exponent: 1.0,
            top_k: 50,
            top_p: 0.8,
            top_a: 0.0,
            min_p: 0.0,
            tfs: 0.0,
            typical: 0.0,
            skew: 0.0,
            temperature_last: false,
            mirostat: false,
            mirostat_tau: 1.5,
            mirostat_eta: 0.1,
            mirostat_mu: None,
            cfg_scale: None,
            dry_allowed_length: 2,
            dry_base: 1.75,
            dry_multiplier: 0.0,
            dry_range: 0,
            dry_max_ngram: 20,
            ngram_index: 0,
            xtc_probability: 0.0,
            xtc_threshold: 0.1,
            xtc_ignore_tokens: None,
        }
    }
}

impl SamplerSettings {
    /// Names of knobs set to a non-neutral value that the CPU processor
    /// does not implement.
    pub fn unsupported_knobs(&self) -> Vec<&'static str> {
        let mut knobs = Vec::new();
        if self.tfs > 0.0 && self.tfs < 1.0 {
            knobs.push("tfs");
        }
        if self.skew != 0.0 {
            knobs.push("skew");
        }
        if self.dry_multiplier > 0.0 {
            knobs.push("dry_multiplier");
        }
        if self.cfg_scale.is_some() {
            knobs.push("cfg_scale");
        }
        knobs
    }
}

// Clients send counts as JSON floats (`"top_k": 40.0`); the fraction is dropped.
fn count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Err(de::Error::custom(format!(
            "expected a non-negative count, got {value}"
        )));
    }
    Ok(value as u32)
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: u32,
    logit: f32,
}

/// Turns one step of raw logits into the next token id.
pub struct LogitsProcessor {
    settings: SamplerSettings,
    rng: StdRng,
    mirostat_mu: f32,
}

impl LogitsProcessor {
    pub fn new(settings: SamplerSettings, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mirostat_mu = settings
            .mirostat_mu
            .unwrap_or(2.0 * settings.mirostat_tau);
        Self {
            settings,
            rng,
            mirostat_mu,
        }
    }

    pub fn sample(&mut self, logits: &[f32], history: &[u32]) -> Result<u32, ServiceError> {
        if logits.is_empty() {
            return Err(ServiceError::Generation(
                "cannot sample from empty logits".into(),
            ));
        }

        let mut logits = logits.to_vec();
        self.apply_penalties(&mut logits, history);

        let s = &self.settings;
        if s.smoothing_factor > 0.0 {
            let max = max_logit(&logits);
            for logit in logits.iter_mut().filter(|l| l.is_finite()) {
                *logit = max - s.smoothing_factor * (*logit - max).powi(2);
            }
        }

        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .filter(|(_, logit)| !logit.is_nan() && **logit != f32::NEG_INFINITY)
            .map(|(id, &logit)| Candidate {
                id: id as u32,
                logit,
            })
            .collect();
        if candidates.is_empty() {
            return Err(ServiceError::Generation(
                "every token was masked out".into(),
            ));
        }
        candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));

        let temperature = self.temperature_for(&candidates);
        if temperature <= 0.0 {
            return Ok(candidates[0].id);
        }
        if !s.temperature_last {
            scale(&mut candidates, temperature);
        }

        if s.mirostat {
            return Ok(self.sample_mirostat(candidates));
        }

        if s.top_k > 0 {
            candidates.truncate(s.top_k as usize);
        }
        if s.top_p > 0.0 && s.top_p < 1.0 {
            filter_top_p(&mut candidates, s.top_p);
        }
        if s.min_p > 0.0 {
            filter_min_p(&mut candidates, s.min_p);
        }
        if s.top_a > 0.0 {
            filter_top_a(&mut candidates, s.top_a);
        }
        if s.typical > 0.0 && s.typical < 1.0 {
            filter_typical(&mut candidates, s.typical);
        }
        if s.xtc_probability > 0.0 && self.rng.r#gen::<f32>() < s.xtc_probability {
            let threshold = s.xtc_threshold;
            let ignore = s.xtc_ignore_tokens.clone().unwrap_or_default();
            exclude_top_choices(&mut candidates, threshold, &ignore);
        }

        if s.temperature_last {
            scale(&mut candidates, temperature);
        }
        Ok(self.draw(&candidates))
    }

    fn apply_penalties(&self, logits: &mut [f32], history: &[u32]) {
        let s = &self.settings;
        let neutral = s.token_repetition_penalty == 1.0
            && s.token_frequency_penalty == 0.0
            && s.token_presence_penalty == 0.0;
        if neutral || history.is_empty() || s.token_repetition_range == 0 {
            return;
        }

        let window = match usize::try_from(s.token_repetition_range) {
            Ok(range) => &history[history.len().saturating_sub(range)..],
            Err(_) => history,
        };

        // Tokens older than `window.len() - decay` are penalised with a
        // linearly fading weight.
        let decay = (s.token_repetition_decay as usize).min(window.len());
        let full_strength_from = window.len() - decay;
        let mut seen: HashMap<u32, (usize, f32)> = HashMap::new();
        for (pos, &id) in window.iter().enumerate() {
            let weight = if pos >= full_strength_from || decay == 0 {
                1.0
            } else {
                (pos + 1) as f32 / (full_strength_from + 1) as f32
            };
            let entry = seen.entry(id).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 = entry.1.max(weight);
        }

        for (id, (count, weight)) in seen {
            let Some(logit) = logits.get_mut(id as usize) else {
                continue;
            };
            let penalty = 1.0 + (s.token_repetition_penalty - 1.0) * weight;
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
            *logit -= s.token_frequency_penalty * count as f32 + s.token_presence_penalty;
        }
    }

    fn temperature_for(&self, candidates: &[Candidate]) -> f32 {
        let s = &self.settings;
        if s.max_temp <= s.min_temp || candidates.len() < 2 {
            return s.temperature;
        }
        let probs = softmax(candidates);
        let entropy: f32 = probs
            .iter()
            .filter(|p| **p > 0.0)
            .map(|p| -p * p.ln())
            .sum();
        let max_entropy = (candidates.len() as f32).ln();
        let normalized = (entropy / max_entropy).clamp(0.0, 1.0);
        s.min_temp + (s.max_temp - s.min_temp) * normalized.powf(s.temp_exponent)
    }

    fn sample_mirostat(&mut self, mut candidates: Vec<Candidate>) -> u32 {
        let probs = softmax(&candidates);
        let keep = probs
            .iter()
            .take_while(|p| -p.log2() <= self.mirostat_mu)
            .count()
            .max(1);
        candidates.truncate(keep);
        let token = self.draw(&candidates);

        let observed = candidates
            .iter()
            .position(|c| c.id == token)
            .map(|idx| -probs[idx].log2())
            .unwrap_or(0.0);
        self.mirostat_mu -= self.settings.mirostat_eta * (observed - self.settings.mirostat_tau);
        token
    }

    fn draw(&mut self, candidates: &[Candidate]) -> u32 {
        let probs = softmax(candidates);
        let mut target = self.rng.r#gen::<f32>();
        for (candidate, p) in candidates.iter().zip(&probs) {
            if target < *p {
                return candidate.id;
            }
            target -= p;
        }
        candidates[candidates.len() - 1].id
    }
}

fn max_logit(logits: &[f32]) -> f32 {
    logits
        .iter()
        .copied()
        .filter(|l| l.is_finite())
        .fold(f32::NEG_INFINITY, f32::max)
}

fn scale(candidates: &mut [Candidate], temperature: f32) {
    for candidate in candidates {
        candidate.logit /= temperature;
    }
}

fn softmax(candidates: &[Candidate]) -> Vec<f32> {
    let max = candidates
        .iter()
        .map(|c| c.logit)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = candidates.iter().map(|c| (c.logit - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

// The filters below expect candidates sorted by descending logit and always
// keep at least one.

fn filter_top_p(candidates: &mut Vec<Candidate>, top_p: f32) {
    let probs = softmax(candidates);
    let mut cumulative = 0.0;
    let mut keep = candidates.len();
    for (idx, p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative >= top_p {
            keep = idx + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

fn filter_min_p(candidates: &mut Vec<Candidate>, min_p: f32) {
    let probs = softmax(candidates);
    let floor = probs[0] * min_p;
    let keep = probs.iter().take_while(|p| **p >= floor).count();
    candidates.truncate(keep.max(1));
}

fn filter_top_a(candidates: &mut Vec<Candidate>, top_a: f32) {
    let probs = softmax(candidates);
    let floor = probs[0] * probs[0] * top_a;
    let keep = probs.iter().take_while(|p| **p >= floor).count();
    candidates.truncate(keep.max(1));
}

fn filter_typical(candidates: &mut Vec<Candidate>, mass: f32) {
    let probs = softmax(candidates);
    let entropy: f32 = probs
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| -p * p.ln())
        .sum();

    let mut ranked: Vec<(usize, f32)> = probs
        .iter()
        .enumerate()
        .map(|(idx, p)| (idx, (-p.ln() - entropy).abs()))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut cumulative = 0.0;
    let mut kept = Vec::new();
    for (idx, _) in ranked {
        kept.push(idx);
        cumulative += probs[idx];
        if cumulative >= mass {
            break;
        }
    }
    kept.sort_unstable();
    *candidates = kept.into_iter().map(|idx| candidates[idx]).collect();
}

/// Removes every candidate at or above `threshold` except the least likely
/// of them, when at least two qualify.
fn exclude_top_choices(candidates: &mut Vec<Candidate>, threshold: f32, ignore: &BTreeSet<u32>) {
    let probs = softmax(candidates);
    let above = probs.iter().take_while(|p| **p >= threshold).count();
    if above < 2 {
        return;
    }
    let mut idx = 0;
    candidates.retain(|c| {
        let drop = idx < above - 1 && !ignore.contains(&c.id);
        idx += 1;
        !drop
    });
}
