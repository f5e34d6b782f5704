//! CTC forward-backward over the blank-extended label lattice.
//!
//! All arithmetic runs in natural-log space on `f64`. The lattice has
//! `2L + 1` states per time-step: even states sit on a blank, odd state
//! `2i + 1` sits on label `i`.

use crate::error::CtcError;

/// Loss of one example and its gradient with respect to the raw logits.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardBackwardOutput {
    /// Negative log-likelihood summed over all valid alignments.
    pub loss: f64,
    /// `T x V`; `softmax(logits) - alignment posterior` per time-step.
    pub gradient: Vec<Vec<f32>>,
}

/// Reusable scratch grids so a worker thread allocates once per batch.
#[derive(Debug, Default)]
pub struct AlignmentLattice {
    log_probs: Vec<f64>,
    alpha: Vec<f64>,
    beta: Vec<f64>,
    extended: Vec<usize>,
}

/// Convenience wrapper that allocates a fresh lattice.
pub fn ctc_forward_backward(
    logits: &[Vec<f32>],
    labels: &[usize],
    blank_id: usize,
) -> Result<ForwardBackwardOutput, CtcError> {
    AlignmentLattice::default().compute(logits, labels, blank_id)
}

/// `[blank, l1, blank, l2, ..., lL, blank]`
pub fn extended_labels(labels: &[usize], blank_id: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(2 * labels.len() + 1);
    fill_extended(&mut out, labels, blank_id);
    out
}

fn fill_extended(out: &mut Vec<usize>, labels: &[usize], blank_id: usize) {
    out.clear();
    out.push(blank_id);
    for &label in labels {
        out.push(label);
        out.push(blank_id);
    }
}

/// Row-wise log-softmax with the row maximum subtracted before `exp`.
pub fn log_softmax_rows(logits: &[Vec<f32>]) -> Result<Vec<Vec<f64>>, CtcError> {
    let vocab = logits.first().map_or(0, Vec::len);
    let mut flat = Vec::new();
    log_softmax_into(&mut flat, logits, vocab)?;
    Ok(flat.chunks(vocab.max(1)).map(<[f64]>::to_vec).collect())
}

fn log_softmax_into(out: &mut Vec<f64>, logits: &[Vec<f32>], vocab: usize) -> Result<(), CtcError> {
    out.clear();
    out.reserve(logits.len() * vocab);
    for (t, row) in logits.iter().enumerate() {
        if row.len() != vocab {
            return Err(CtcError::invalid_input(format!(
                "logit row {t} has {} classes, expected {vocab}",
                row.len()
            )));
        }
        if let Some(&bad) = row.iter().find(|x| x.is_nan() || **x == f32::INFINITY) {
            return Err(CtcError::numerical(format!("logit row {t} contains {bad}")));
        }
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
        if max == f64::NEG_INFINITY {
            return Err(CtcError::numerical(format!(
                "logit row {t} assigns zero probability to every class"
            )));
        }
        let sum: f64 = row.iter().map(|&x| (x as f64 - max).exp()).sum();
        let log_norm = max + sum.ln();
        out.extend(row.iter().map(|&x| x as f64 - log_norm));
    }
    Ok(())
}

#[inline(always)]
fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + (-(a - b).abs()).exp().ln_1p()
}

/// Skipping the blank in front of state `s` is only legal when `s` is a
/// label that differs from the previous label.
#[inline(always)]
fn can_skip(extended: &[usize], s: usize, blank_id: usize) -> bool {
    s >= 2 && extended[s] != blank_id && extended[s] != extended[s - 2]
}

impl AlignmentLattice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs forward-backward for one example. `logits` holds exactly the
    /// example's valid time-steps.
    pub fn compute(
        &mut self,
        logits: &[Vec<f32>],
        labels: &[usize],
        blank_id: usize,
    ) -> Result<ForwardBackwardOutput, CtcError> {
        let t_len = logits.len();
        let vocab = logits.first().map_or(0, Vec::len);
        if t_len == 0 {
            return Err(CtcError::sequence_length("logit sequence is empty"));
        }
        if blank_id >= vocab {
            return Err(CtcError::invalid_input(format!(
                "blank id {blank_id} outside vocabulary of {vocab}"
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= vocab || l == blank_id) {
            return Err(CtcError::invalid_input(format!(
                "label {bad} is not a non-blank class of a {vocab}-way vocabulary"
            )));
        }
        let s_len = 2 * labels.len() + 1;
        if s_len > t_len {
            return Err(CtcError::sequence_length(format!(
                "{} labels need {s_len} time-steps, only {t_len} available",
                labels.len()
            )));
        }

        log_softmax_into(&mut self.log_probs, logits, vocab)?;
        fill_extended(&mut self.extended, labels, blank_id);

        let lp = &self.log_probs;
        let ext = &self.extended;
        let emit = |t: usize, s: usize| lp[t * vocab + ext[s]];

        self.alpha.clear();
        self.alpha.resize(t_len * s_len, f64::NEG_INFINITY);
        let alpha = &mut self.alpha;
        alpha[0] = emit(0, 0);
        if s_len > 1 {
            alpha[1] = emit(0, 1);
        }
        for t in 1..t_len {
            let (prev, curr) = alpha[(t - 1) * s_len..(t + 1) * s_len].split_at_mut(s_len);
            for s in 0..s_len {
                let mut acc = prev[s];
                if s >= 1 {
                    acc = log_add(acc, prev[s - 1]);
                }
                if can_skip(ext, s, blank_id) {
                    acc = log_add(acc, prev[s - 2]);
                }
                curr[s] = acc + emit(t, s);
            }
        }

        let last = (t_len - 1) * s_len;
        let mut log_likelihood = alpha[last + s_len - 1];
        if s_len > 1 {
            log_likelihood = log_add(log_likelihood, alpha[last + s_len - 2]);
        }
        if !log_likelihood.is_finite() {
            return Err(CtcError::numerical(format!(
                "total alignment probability is {}",
                log_likelihood.exp()
            )));
        }

        // beta[t][s]: mass of completing from (t, s), emissions after t only.
        self.beta.clear();
        self.beta.resize(t_len * s_len, f64::NEG_INFINITY);
        let beta = &mut self.beta;
        beta[last + s_len - 1] = 0.0;
        if s_len > 1 {
            beta[last + s_len - 2] = 0.0;
        }
        for t in (0..t_len - 1).rev() {
            let (curr, next) = beta[t * s_len..(t + 2) * s_len].split_at_mut(s_len);
            for s in 0..s_len {
                let mut acc = next[s] + emit(t + 1, s);
                if s + 1 < s_len {
                    acc = log_add(acc, next[s + 1] + emit(t + 1, s + 1));
                }
                if s + 2 < s_len && can_skip(ext, s + 2, blank_id) {
                    acc = log_add(acc, next[s + 2] + emit(t + 1, s + 2));
                }
                curr[s] = acc;
            }
        }

        let mut gradient = Vec::with_capacity(t_len);
        for t in 0..t_len {
            let row_lp = &lp[t * vocab..(t + 1) * vocab];
            let mut grad: Vec<f64> = row_lp.iter().map(|x| x.exp()).collect();
            for s in 0..s_len {
                let idx = t * s_len + s;
                let occupancy = alpha[idx] + beta[idx] - log_likelihood;
                if occupancy > f64::NEG_INFINITY {
                    grad[ext[s]] -= occupancy.exp();
                }
            }
            gradient.push(grad.into_iter().map(|g| g as f32).collect());
        }

        Ok(ForwardBackwardOutput {
            loss: -log_likelihood,
            gradient,
        })
    }
}
