/// `batch x time x vocab` logits, batch-major as the acoustic model emits them.
pub type LogitBatch = Vec<Vec<Vec<f32>>>;

/// `batch x max_label_len` label ids, right-padded with the pad id.
pub type LabelBatch = Vec<Vec<usize>>;

/// What the reducer does with an example whose labels cannot be aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfeasiblePolicy {
    /// Fail the whole batch with the first infeasible example.
    #[default]
    Abort,
    /// Log a warning, drop the example and reduce over the rest.
    Skip,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ExampleLoss {
    pub logit_length: usize,
    pub label_length: usize,
    /// Unreduced negative log-likelihood; `None` when the example was skipped.
    pub loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CtcLossOutput {
    /// Reduced loss divided by the division factor.
    pub loss: f64,
    pub examples: Vec<ExampleLoss>,
    /// d(loss)/d(logits), same shape as the input batch.
    pub gradient: LogitBatch,
    pub skipped: Vec<usize>,
}
