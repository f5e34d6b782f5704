use rayon::prelude::*;

use crate::config::LossReduction;
use crate::ctc::forward_backward::{AlignmentLattice, ForwardBackwardOutput};
use crate::error::CtcError;
use crate::types::{CtcLossOutput, ExampleLoss, InfeasiblePolicy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReduceOptions {
    pub pad_id: usize,
    pub blank_id: usize,
    pub reduction: LossReduction,
    pub division_factor: f64,
    pub infeasible: InfeasiblePolicy,
}

impl Default for ReduceOptions {
    fn default() -> Self {
        Self {
            pad_id: 0,
            blank_id: 0,
            reduction: LossReduction::Sum,
            division_factor: 1.0,
            infeasible: InfeasiblePolicy::Abort,
        }
    }
}

/// Number of leading non-pad labels. Padding must be a pure suffix, so a
/// pad id between real labels is an error rather than a silent miscount.
pub fn label_length(labels: &[usize], pad_id: usize) -> Result<usize, CtcError> {
    let len = labels.iter().position(|&l| l == pad_id).unwrap_or(labels.len());
    if let Some(offset) = labels[len..].iter().position(|&l| l != pad_id) {
        return Err(CtcError::invalid_input(format!(
            "label {} found after padding at position {}; pad id {pad_id} cannot appear inside a label sequence",
            labels[len + offset],
            len + offset
        )));
    }
    Ok(len)
}

/// Folds per-example losses into the training scalar.
pub fn apply_reduction(
    losses: &[f64],
    reduction: LossReduction,
    division_factor: f64,
) -> Result<f64, CtcError> {
    if division_factor == 0.0 || !division_factor.is_finite() {
        return Err(CtcError::DivideByZero);
    }
    if losses.is_empty() {
        return Err(CtcError::invalid_input("no examples to reduce"));
    }
    let sum: f64 = losses.iter().sum();
    let reduced = match reduction {
        LossReduction::Sum => sum,
        LossReduction::Mean => sum / losses.len() as f64,
    };
    Ok(reduced / division_factor)
}

/// Batch CTC loss using the built-in forward-backward with one pooled
/// lattice per worker thread.
pub fn reduce(
    logit_lengths: &[usize],
    labels: &[Vec<usize>],
    logits: &[Vec<Vec<f32>>],
    options: &ReduceOptions,
) -> Result<CtcLossOutput, CtcError> {
    reduce_lengths(known_lengths(logit_lengths), labels, logits, options)
}

/// Same as [`reduce`] but with a caller-provided per-example scorer.
pub fn reduce_with<F>(
    logit_lengths: &[usize],
    labels: &[Vec<usize>],
    logits: &[Vec<Vec<f32>>],
    options: &ReduceOptions,
    score: F,
) -> Result<CtcLossOutput, CtcError>
where
    F: Fn(&[Vec<f32>], &[usize], usize) -> Result<ForwardBackwardOutput, CtcError> + Sync,
{
    reduce_lengths_with(known_lengths(logit_lengths), labels, logits, options, score)
}

/// Variant of [`reduce`] whose logit lengths may have failed to project.
/// An infeasible length is subject to the same policy as an infeasible
/// label sequence.
pub(crate) fn reduce_lengths(
    logit_lengths: Vec<Result<usize, CtcError>>,
    labels: &[Vec<usize>],
    logits: &[Vec<Vec<f32>>],
    options: &ReduceOptions,
) -> Result<CtcLossOutput, CtcError> {
    let scores = score_batch(logit_lengths, labels, logits, options, |jobs| {
        jobs.into_par_iter()
            .map_init(AlignmentLattice::new, |lattice, job| {
                job.and_then(|(x, y)| lattice.compute(x, y, options.blank_id))
            })
            .collect()
    })?;
    finish(scores, logits, options)
}

pub(crate) fn reduce_lengths_with<F>(
    logit_lengths: Vec<Result<usize, CtcError>>,
    labels: &[Vec<usize>],
    logits: &[Vec<Vec<f32>>],
    options: &ReduceOptions,
    score: F,
) -> Result<CtcLossOutput, CtcError>
where
    F: Fn(&[Vec<f32>], &[usize], usize) -> Result<ForwardBackwardOutput, CtcError> + Sync,
{
    let scores = score_batch(logit_lengths, labels, logits, options, |jobs| {
        jobs.into_par_iter()
            .map(|job| job.and_then(|(x, y)| score(x, y, options.blank_id)))
            .collect()
    })?;
    finish(scores, logits, options)
}

fn known_lengths(logit_lengths: &[usize]) -> Vec<Result<usize, CtcError>> {
    logit_lengths.iter().map(|&len| Ok(len)).collect()
}

type Job<'a> = Result<(&'a [Vec<f32>], &'a [usize]), CtcError>;

struct Scored {
    logit_length: usize,
    label_length: usize,
    result: Result<ForwardBackwardOutput, CtcError>,
}

fn score_batch<'a, R>(
    logit_lengths: Vec<Result<usize, CtcError>>,
    labels: &'a [Vec<usize>],
    logits: &'a [Vec<Vec<f32>>],
    options: &ReduceOptions,
    run: R,
) -> Result<Vec<Scored>, CtcError>
where
    R: FnOnce(Vec<Job<'a>>) -> Vec<Result<ForwardBackwardOutput, CtcError>>,
{
    if options.division_factor == 0.0 || !options.division_factor.is_finite() {
        return Err(CtcError::DivideByZero);
    }
    let batch = logits.len();
    if batch == 0 {
        return Err(CtcError::invalid_input("empty batch"));
    }
    if labels.len() != batch || logit_lengths.len() != batch {
        return Err(CtcError::invalid_input(format!(
            "batch size mismatch: {batch} logit sequences, {} label sequences, {} logit lengths",
            labels.len(),
            logit_lengths.len()
        )));
    }

    let mut lengths = Vec::with_capacity(batch);
    let mut jobs = Vec::with_capacity(batch);
    for (idx, ((x, y), t_len)) in logits.iter().zip(labels).zip(logit_lengths).enumerate() {
        let l_len = label_length(y, options.pad_id).map_err(|e| match e {
            CtcError::InvalidInput { message } => {
                CtcError::invalid_input(format!("example {idx}: {message}"))
            }
            other => other,
        })?;
        let t_len = match t_len {
            Ok(t_len) => t_len,
            Err(err) => {
                lengths.push((0, l_len));
                jobs.push(Err(err));
                continue;
            }
        };
        if t_len > x.len() {
            return Err(CtcError::invalid_input(format!(
                "example {idx}: logit length {t_len} exceeds {} available time-steps",
                x.len()
            )));
        }
        lengths.push((t_len, l_len));
        jobs.push(if t_len == 0 {
            Err(CtcError::sequence_length("logit length is zero"))
        } else {
            Ok((&x[..t_len], &y[..l_len]))
        });
    }

    let results = run(jobs);
    Ok(lengths
        .into_iter()
        .zip(results)
        .map(|((logit_length, label_length), result)| Scored {
            logit_length,
            label_length,
            result,
        })
        .collect())
}

fn finish(
    scores: Vec<Scored>,
    logits: &[Vec<Vec<f32>>],
    options: &ReduceOptions,
) -> Result<CtcLossOutput, CtcError> {
    let mut examples = Vec::with_capacity(scores.len());
    let mut outputs = Vec::with_capacity(scores.len());
    let mut skipped = Vec::new();
    for (idx, scored) in scores.into_iter().enumerate() {
        let logit_length = scored.logit_length;
        match scored.result {
            Ok(out) => {
                examples.push(ExampleLoss {
                    logit_length,
                    label_length: scored.label_length,
                    loss: Some(out.loss),
                });
                outputs.push(Some(out));
            }
            Err(err) if err.is_infeasible() && options.infeasible == InfeasiblePolicy::Skip => {
                tracing::warn!(
                    example = idx,
                    logit_length,
                    label_length = scored.label_length,
                    error = %err,
                    "ctc: skipping infeasible example"
                );
                examples.push(ExampleLoss {
                    logit_length,
                    label_length: scored.label_length,
                    loss: None,
                });
                outputs.push(None);
                skipped.push(idx);
            }
            Err(err) => return Err(err.in_example(idx)),
        }
    }

    let losses: Vec<f64> = examples.iter().filter_map(|e| e.loss).collect();
    if losses.is_empty() {
        return Err(CtcError::sequence_length(format!(
            "all {} examples in the batch are infeasible",
            examples.len()
        )));
    }
    let loss = apply_reduction(&losses, options.reduction, options.division_factor)?;

    let mut scale = 1.0 / options.division_factor;
    if options.reduction == LossReduction::Mean {
        scale /= losses.len() as f64;
    }
    let gradient = outputs
        .into_iter()
        .zip(logits)
        .map(|(out, x)| {
            let vocab = x.first().map_or(0, Vec::len);
            let mut rows = out.map(|o| o.gradient).unwrap_or_default();
            for row in &mut rows {
                for g in row.iter_mut() {
                    *g = (*g as f64 * scale) as f32;
                }
            }
            rows.resize(x.len(), vec![0.0; vocab]);
            rows
        })
        .collect();

    tracing::debug!(
        batch = examples.len(),
        skipped = skipped.len(),
        reduction = %options.reduction,
        division_factor = options.division_factor,
        loss,
        "ctc: reduced batch loss"
    );

    Ok(CtcLossOutput {
        loss,
        examples,
        gradient,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctc::forward_backward::ctc_forward_backward;

    fn fixed_losses(
        x: &[Vec<f32>],
        _y: &[usize],
        _blank: usize,
    ) -> Result<ForwardBackwardOutput, CtcError> {
        Ok(ForwardBackwardOutput {
            loss: x[0][0] as f64,
            gradient: vec![vec![1.0; x[0].len()]; x.len()],
        })
    }

    fn two_example_batch() -> (Vec<Vec<Vec<f32>>>, Vec<Vec<usize>>) {
        let logits = vec![vec![vec![2.0, 0.0]; 3], vec![vec![4.0, 0.0]; 3]];
        let labels = vec![vec![1, 0], vec![1, 1]];
        (logits, labels)
    }

    #[test]
    fn sum_and_mean_with_division_factor() {
        let (logits, labels) = two_example_batch();
        for (reduction, factor, expected) in [
            (LossReduction::Sum, 1.0, 6.0),
            (LossReduction::Mean, 1.0, 3.0),
            (LossReduction::Sum, 2.0, 3.0),
            (LossReduction::Mean, 2.0, 1.5),
        ] {
            let options = ReduceOptions {
                pad_id: 0,
                blank_id: 0,
                reduction,
                division_factor: factor,
                ..Default::default()
            };
            let out = reduce_with(&[3, 1], &labels, &logits, &options, fixed_losses).unwrap();
            assert!((out.loss - expected).abs() < 1e-12, "{reduction} / {factor}");
            assert_eq!(apply_reduction(&[2.0, 4.0], reduction, factor).unwrap(), expected);
        }
    }

    #[test]
    fn zero_division_factor_fails() {
        let (logits, labels) = two_example_batch();
        let options = ReduceOptions {
            division_factor: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            reduce(&[3, 3], &labels, &logits, &options),
            Err(CtcError::DivideByZero)
        ));
        assert!(matches!(
            apply_reduction(&[1.0], LossReduction::Sum, 0.0),
            Err(CtcError::DivideByZero)
        ));
    }

    #[test]
    fn label_length_counts_prefix_before_padding() {
        assert_eq!(label_length(&[3, 4, 5, 0, 0], 0).unwrap(), 3);
        assert_eq!(label_length(&[3, 4], 0).unwrap(), 2);
        assert_eq!(label_length(&[0, 0], 0).unwrap(), 0);
        assert_eq!(label_length(&[], 0).unwrap(), 0);
        assert!(label_length(&[3, 0, 4, 0], 0).is_err());
    }

    #[test]
    fn reduce_matches_per_example_forward_backward() {
        let logits = vec![
            vec![vec![0.5, -0.2, 1.0]; 6],
            vec![vec![-1.0, 0.3, 0.1]; 6],
        ];
        let labels = vec![vec![1, 2, 0], vec![2, 0, 0]];
        let options = ReduceOptions {
            reduction: LossReduction::Mean,
            ..Default::default()
        };
        let out = reduce(&[6, 4], &labels, &logits, &options).unwrap();

        let a = ctc_forward_backward(&logits[0], &[1, 2], 0).unwrap();
        let b = ctc_forward_backward(&logits[1][..4], &[2], 0).unwrap();
        assert!((out.loss - (a.loss + b.loss) / 2.0).abs() < 1e-9);
        assert_eq!(out.examples[0].label_length, 2);
        assert_eq!(out.examples[1].label_length, 1);
        assert_eq!(out.examples[1].logit_length, 4);

        assert_eq!(out.gradient[1].len(), 6);
        assert!((out.gradient[0][0][1] - a.gradient[0][1] / 2.0).abs() < 1e-6);
        assert!(out.gradient[1][4].iter().all(|&g| g == 0.0));
        assert!(out.gradient[1][5].iter().all(|&g| g == 0.0));
    }

    #[test]
    fn infeasible_example_aborts_by_default() {
        let logits = vec![vec![vec![0.0; 3]; 5], vec![vec![0.0; 3]; 5]];
        let labels = vec![vec![1, 0, 0], vec![1, 2, 1]];
        let err = reduce(&[5, 5], &labels, &logits, &ReduceOptions::default()).unwrap_err();
        assert!(err.is_infeasible());
        assert!(err.to_string().contains("example 1"));
    }

    #[test]
    fn infeasible_example_can_be_skipped() {
        let logits = vec![vec![vec![0.0; 3]; 5], vec![vec![0.0; 3]; 5]];
        let labels = vec![vec![1, 0, 0], vec![1, 2, 1]];
        let options = ReduceOptions {
            infeasible: InfeasiblePolicy::Skip,
            reduction: LossReduction::Mean,
            ..Default::default()
        };
        let out = reduce(&[5, 5], &labels, &logits, &options).unwrap();
        assert_eq!(out.skipped, vec![1]);
        assert_eq!(out.examples[1].loss, None);
        let single = ctc_forward_backward(&logits[0], &[1], 0).unwrap();
        assert!((out.loss - single.loss).abs() < 1e-9);
        assert!(out.gradient[1].iter().flatten().all(|&g| g == 0.0));
    }

    #[test]
    fn failed_length_projection_follows_infeasible_policy() {
        let logits = vec![vec![vec![0.0; 3]; 5], vec![vec![0.0; 3]; 5]];
        let labels = vec![vec![1, 0], vec![2, 0]];
        let lengths = || vec![Ok(5), Err(CtcError::sequence_length("kernel does not fit"))];

        let err = reduce_lengths(lengths(), &labels, &logits, &ReduceOptions::default())
            .unwrap_err();
        assert!(err.is_infeasible());
        assert!(err.to_string().contains("example 1"));

        let options = ReduceOptions {
            infeasible: InfeasiblePolicy::Skip,
            ..Default::default()
        };
        let out = reduce_lengths(lengths(), &labels, &logits, &options).unwrap();
        assert_eq!(out.skipped, vec![1]);
        assert_eq!(out.examples[1].logit_length, 0);
        assert_eq!(out.examples[1].label_length, 1);
        let single = ctc_forward_backward(&logits[0], &[1], 0).unwrap();
        assert!((out.loss - single.loss).abs() < 1e-9);
    }

    #[test]
    fn all_skipped_batch_is_an_error() {
        let logits = vec![vec![vec![0.0; 3]; 2]];
        let labels = vec![vec![1, 2]];
        let options = ReduceOptions {
            infeasible: InfeasiblePolicy::Skip,
            ..Default::default()
        };
        assert!(reduce(&[2], &labels, &logits, &options).unwrap_err().is_infeasible());
    }

    #[test]
    fn shape_errors_are_reported() {
        let (logits, labels) = two_example_batch();
        let options = ReduceOptions::default();
        assert!(matches!(
            reduce(&[3], &labels, &logits, &options),
            Err(CtcError::InvalidInput { .. })
        ));
        assert!(matches!(
            reduce(&[3, 4], &labels, &logits, &options),
            Err(CtcError::InvalidInput { .. })
        ));
        assert!(matches!(
            reduce(&[], &[], &[], &options),
            Err(CtcError::InvalidInput { .. })
        ));
    }

    #[test]
    fn pad_inside_labels_is_flagged() {
        let logits = vec![vec![vec![0.0; 3]; 9]];
        let labels = vec![vec![1, 0, 2]];
        let err = reduce(&[9], &labels, &logits, &ReduceOptions::default()).unwrap_err();
        assert!(err.to_string().contains("example 0"));
    }
}
