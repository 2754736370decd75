//! Next-token selection over a single row of logits.
//!
//! The forward pass is run by `tch`; this module only turns the last
//! position's logits into a token id.

use std::collections::HashSet;

use rand::Rng;

use crate::model::GenerationParams;

#[derive(Debug, Clone, PartialEq)]
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    repetition_penalty: Option<f32>,
    do_sample: bool,
}

impl Sampler {
    pub fn new(params: &GenerationParams) -> Self {
        Self {
            temperature: params.temperature as f32,
            top_p: params.top_p as f32,
            repetition_penalty: params.repetition_penalty.map(|p| p as f32),
            do_sample: params.do_sample,
        }
    }

    /// Picks the next token id. `history` holds every id already in the
    /// sequence, prompt included. Returns `None` for an empty row.
    pub fn next_token<R: Rng + ?Sized>(
        &self,
        logits: &mut [f32],
        history: &[i64],
        rng: &mut R,
    ) -> Option<usize> {
        if logits.is_empty() {
            return None;
        }

        if let Some(penalty) = self.repetition_penalty {
            apply_repetition_penalty(logits, history, penalty);
        }

        if !self.do_sample || self.temperature <= 0.0 {
            return argmax(logits);
        }

        let probs = softmax(logits, self.temperature);
        let nucleus = nucleus(&probs, self.top_p);
        let mass: f32 = nucleus.iter().map(|&(_, p)| p).sum();

        let mut draw = rng.gen_range(0.0..1.0f32) * mass;
        for &(idx, p) in &nucleus {
            if draw < p {
                return Some(idx);
            }
            draw -= p;
        }
        nucleus.last().map(|&(idx, _)| idx)
    }
}

fn apply_repetition_penalty(logits: &mut [f32], history: &[i64], penalty: f32) {
    let seen: HashSet<usize> = history
        .iter()
        .filter_map(|&id| usize::try_from(id).ok())
        .collect();
    for id in seen {
        if let Some(logit) = logits.get_mut(id) {
            *logit = if *logit > 0.0 {
                *logit / penalty
            } else {
                *logit * penalty
            };
        }
    }
}

fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx)
}

fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Smallest highest-probability prefix whose mass reaches `top_p`.
/// Always keeps at least one token.
fn nucleus(probs: &[f32], top_p: f32) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut cumulative = 0.0;
    let mut keep = 0;
    for &(_, p) in &ranked {
        if keep > 0 && cumulative >= top_p {
            break;
        }
        cumulative += p;
        keep += 1;
    }
    ranked.truncate(keep);
    ranked
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn params(do_sample: bool, top_p: f64, penalty: Option<f64>) -> GenerationParams {
        GenerationParams {
            max_length: 16,
            temperature: 0.7,
            top_p,
            repetition_penalty: penalty,
            do_sample,
        }
    }

    #[test]
    fn greedy_picks_highest_logit() {
        let sampler = Sampler::new(&params(false, 0.95, None));
        let mut rng = StdRng::seed_from_u64(7);
        let mut logits = vec![0.1, 2.5, -1.0, 2.4];
        assert_eq!(sampler.next_token(&mut logits, &[], &mut rng), Some(1));
    }

    #[test]
    fn tiny_top_p_keeps_only_the_best_token() {
        let sampler = Sampler::new(&params(true, 0.01, None));
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let mut logits = vec![1.0, 3.0, 2.0, 0.5];
            assert_eq!(sampler.next_token(&mut logits, &[], &mut rng), Some(1));
        }
    }

    #[test]
    fn sampling_stays_inside_the_nucleus() {
        let sampler = Sampler::new(&params(true, 0.9, None));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            // Token 3 carries almost no mass and must never be drawn.
            let mut logits = vec![5.0, 5.0, 5.0, -20.0];
            let picked = sampler.next_token(&mut logits, &[], &mut rng).unwrap();
            assert!(picked < 3, "picked {picked}");
        }
    }

    #[test]
    fn repetition_penalty_demotes_seen_tokens() {
        let sampler = Sampler::new(&params(false, 0.95, Some(2.0)));
        let mut rng = StdRng::seed_from_u64(1);
        let mut logits = vec![3.0, 2.0, -1.0];
        assert_eq!(sampler.next_token(&mut logits, &[0, 0, 2], &mut rng), Some(1));
        assert_eq!(logits, vec![1.5, 2.0, -2.0]);
    }

    #[test]
    fn out_of_range_history_ids_are_ignored() {
        let sampler = Sampler::new(&params(false, 0.95, Some(1.5)));
        let mut rng = StdRng::seed_from_u64(1);
        let mut logits = vec![1.0, 0.5];
        assert_eq!(sampler.next_token(&mut logits, &[-1, 99], &mut rng), Some(0));
    }

    #[test]
    fn empty_row_yields_nothing() {
        let sampler = Sampler::new(&params(true, 0.95, None));
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sampler.next_token(&mut [], &[], &mut rng), None);
    }
}
