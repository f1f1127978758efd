use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, LogNormal, Normal};

use super::MessageSizeDistribution;

pub fn sample_poisson(rng: &mut impl Rng, lambda: f64) -> usize {
    if !lambda.is_finite() || lambda <= 0.0 {
        return 0;
    }
    let l = (-lambda).exp();
    let mut k = 0usize;
    let mut p = 1.0;
    while p > l {
        k += 1;
        p *= rng.gen::<f64>();
    }
    k.saturating_sub(1)
}

/// `true` with probability `p`, clamped to `[0, 1]`.
pub fn sample_bernoulli(rng: &mut impl Rng, p: f64) -> bool {
    if !p.is_finite() || p <= 0.0 {
        return false;
    }
    rng.gen_bool(p.min(1.0))
}

/// Up to `count` distinct addresses from `candidates`, in random order.
pub fn sample_recipients(rng: &mut impl Rng, candidates: &[String], count: usize) -> Vec<String> {
    candidates
        .choose_multiple(rng, count.min(candidates.len()))
        .cloned()
        .collect()
}

pub fn generate_message_body(rng: &mut impl Rng, distribution: &MessageSizeDistribution) -> String {
    const LOREM: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ";
    let target_size = sample_message_size(rng, distribution);
    if target_size == 0 {
        return String::new();
    }
    let mut body = String::with_capacity(target_size);
    while body.len() < target_size {
        body.push_str(LOREM);
    }
    body.truncate(target_size);
    body
}

pub fn sample_message_size(rng: &mut impl Rng, distribution: &MessageSizeDistribution) -> usize {
    match distribution {
        MessageSizeDistribution::Uniform { min, max } => {
            let (min, max) = normalize_bounds(*min, *max);
            rng.gen_range(min..=max)
        }
        MessageSizeDistribution::Normal {
            mean,
            std_dev,
            min,
            max,
        } => {
            let (min, max) = normalize_bounds(*min, *max);
            match Normal::new(*mean, *std_dev) {
                Ok(normal) if *std_dev > 0.0 => clamp_sample(normal.sample(rng), min, max),
                _ => min,
            }
        }
        MessageSizeDistribution::LogNormal {
            mean,
            std_dev,
            min,
            max,
        } => {
            let (min, max) = normalize_bounds(*min, *max);
            match LogNormal::new(*mean, *std_dev) {
                Ok(log_normal) if *std_dev > 0.0 => clamp_sample(log_normal.sample(rng), min, max),
                _ => min,
            }
        }
    }
}

fn clamp_sample(sample: f64, min: usize, max: usize) -> usize {
    if !sample.is_finite() {
        return min;
    }
    let clamped = sample.max(min as f64).min(max as f64);
    clamped.round() as usize
}

fn normalize_bounds(min: usize, max: usize) -> (usize, usize) {
    if min <= max {
        (min, max)
    } else {
        (max, min)
    }
}
