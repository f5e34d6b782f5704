use crate::ctc::forward_backward::ForwardBackwardOutput;
use crate::error::CtcError;

/// Per-example loss and gradient. Implementations run concurrently across
/// the batch and must not share mutable state between calls.
pub trait SequenceScorer: Send + Sync {
    fn score(
        &self,
        logits: &[Vec<f32>],
        labels: &[usize],
        blank_id: usize,
    ) -> Result<ForwardBackwardOutput, CtcError>;
}
