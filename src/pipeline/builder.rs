use crate::config::Wav2Vec2Config;
use crate::ctc::length::project_length;
use crate::ctc::reducer::ReduceOptions;
use crate::error::CtcError;
use crate::pipeline::runtime::{CtcLoss, CtcLossParts};
use crate::pipeline::traits::SequenceScorer;
use crate::types::InfeasiblePolicy;

pub struct CtcLossBuilder {
    config: Wav2Vec2Config,
    model_input_frames: usize,
    division_factor: f64,
    infeasible: InfeasiblePolicy,
    scorer: Option<Box<dyn SequenceScorer>>,
}

impl CtcLossBuilder {
    /// `model_input_frames` is the fixed raw-sample length of every input
    /// fed to the acoustic model.
    pub fn new(config: &Wav2Vec2Config, model_input_frames: usize) -> Self {
        Self {
            config: config.clone(),
            model_input_frames,
            division_factor: 1.0,
            infeasible: InfeasiblePolicy::Abort,
            scorer: None,
        }
    }

    /// Extra divisor applied after reduction, e.g. gradient-accumulation steps.
    pub fn with_division_factor(mut self, division_factor: f64) -> Self {
        self.division_factor = division_factor;
        self
    }

    pub fn with_infeasible_policy(mut self, infeasible: InfeasiblePolicy) -> Self {
        self.infeasible = infeasible;
        self
    }

    pub fn with_scorer(mut self, scorer: Box<dyn SequenceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn build(self) -> Result<CtcLoss, CtcError> {
        if self.division_factor == 0.0 || !self.division_factor.is_finite() {
            return Err(CtcError::DivideByZero);
        }
        let descriptors = self.config.conv_descriptors();
        let logit_length = project_length(self.model_input_frames, &descriptors)?;
        tracing::debug!(
            model_input_frames = self.model_input_frames,
            logit_length,
            conv_layers = descriptors.len(),
            "ctc: projected logit length"
        );

        Ok(CtcLoss::from_parts(CtcLossParts {
            logit_length,
            descriptors,
            options: ReduceOptions {
                pad_id: self.config.pad_id(),
                blank_id: self.config.blank_id(),
                reduction: self.config.loss_reduction(),
                division_factor: self.division_factor,
                infeasible: self.infeasible,
            },
            scorer: self.scorer,
        }))
    }
}
