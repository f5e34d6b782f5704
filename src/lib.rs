pub mod config;
pub mod ctc;
pub mod error;
pub mod pipeline;
pub mod types;

pub use config::{LossReduction, Wav2Vec2Config, Wav2Vec2ConfigRecord};
pub use ctc::forward_backward::{ctc_forward_backward, AlignmentLattice, ForwardBackwardOutput};
pub use ctc::length::{project_length, project_lengths, ConvDescriptor};
pub use ctc::reducer::{apply_reduction, label_length, reduce, reduce_with, ReduceOptions};
pub use error::CtcError;
pub use pipeline::builder::CtcLossBuilder;
pub use pipeline::runtime::{CtcLoss, TensorLossOutput};
pub use pipeline::traits::SequenceScorer;
pub use types::{CtcLossOutput, ExampleLoss, InfeasiblePolicy, LabelBatch, LogitBatch};
