use candle_core::Tensor;

use crate::ctc::length::{project_length, ConvDescriptor};
use crate::ctc::reducer::{reduce_lengths, reduce_lengths_with, ReduceOptions};
use crate::ctc::tensor::{gradients_to_tensor, labels_from_tensor, logits_from_tensor};
use crate::error::CtcError;
use crate::pipeline::traits::SequenceScorer;
use crate::types::CtcLossOutput;

/// Batch CTC loss bound to one config and one model input length.
pub struct CtcLoss {
    logit_length: usize,
    descriptors: Vec<ConvDescriptor>,
    options: ReduceOptions,
    scorer: Option<Box<dyn SequenceScorer>>,
}

pub(crate) struct CtcLossParts {
    pub logit_length: usize,
    pub descriptors: Vec<ConvDescriptor>,
    pub options: ReduceOptions,
    pub scorer: Option<Box<dyn SequenceScorer>>,
}

pub struct TensorLossOutput {
    pub loss: f64,
    /// Same shape and device as the logits passed in.
    pub gradient: Tensor,
    pub skipped: Vec<usize>,
}

impl CtcLoss {
    pub(crate) fn from_parts(parts: CtcLossParts) -> Self {
        Self {
            logit_length: parts.logit_length,
            descriptors: parts.descriptors,
            options: parts.options,
            scorer: parts.scorer,
        }
    }

    /// Encoder time-steps produced from the configured model input length.
    pub fn logit_length(&self) -> usize {
        self.logit_length
    }

    pub fn options(&self) -> &ReduceOptions {
        &self.options
    }

    /// Loss for a fixed-length batch: every example gets the same projected
    /// logit length.
    pub fn compute(
        &self,
        logits: &[Vec<Vec<f32>>],
        labels: &[Vec<usize>],
    ) -> Result<CtcLossOutput, CtcError> {
        let logit_lengths = (0..logits.len()).map(|_| Ok(self.logit_length)).collect();
        self.run(logit_lengths, labels, logits)
    }

    /// Loss for a variable-length batch; `input_lengths` are raw sample counts.
    /// An example too short for the conv stack falls under the infeasible
    /// policy like any other unalignable example.
    pub fn compute_with_input_lengths(
        &self,
        logits: &[Vec<Vec<f32>>],
        labels: &[Vec<usize>],
        input_lengths: &[usize],
    ) -> Result<CtcLossOutput, CtcError> {
        let logit_lengths = input_lengths
            .iter()
            .map(|&len| project_length(len, &self.descriptors))
            .collect();
        self.run(logit_lengths, labels, logits)
    }

    /// `logits`: `(batch, time, vocab)`; `labels`: `(batch, max_label_len)`.
    pub fn compute_tensor(
        &self,
        logits: &Tensor,
        labels: &Tensor,
    ) -> Result<TensorLossOutput, CtcError> {
        let host_logits = logits_from_tensor(logits)?;
        let host_labels = labels_from_tensor(labels)?;
        let out = self.compute(&host_logits, &host_labels)?;
        let gradient = gradients_to_tensor(&out.gradient, logits.device())?
            .to_dtype(logits.dtype())
            .map_err(|e| CtcError::tensor("gradient dtype", e))?;
        Ok(TensorLossOutput {
            loss: out.loss,
            gradient,
            skipped: out.skipped,
        })
    }

    fn run(
        &self,
        logit_lengths: Vec<Result<usize, CtcError>>,
        labels: &[Vec<usize>],
        logits: &[Vec<Vec<f32>>],
    ) -> Result<CtcLossOutput, CtcError> {
        match &self.scorer {
            Some(scorer) => {
                reduce_lengths_with(logit_lengths, labels, logits, &self.options, |x, y, b| {
                    scorer.score(x, y, b)
                })
            }
            None => reduce_lengths(logit_lengths, labels, logits, &self.options),
        }
    }
}
