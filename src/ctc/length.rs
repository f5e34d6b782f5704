use crate::error::CtcError;

/// One strided 1-D convolution of the feature extractor, without padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDescriptor {
    pub kernel_size: usize,
    pub stride: usize,
}

impl ConvDescriptor {
    pub const fn new(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size,
            stride,
        }
    }

    /// `1 + floor((input_length - kernel_size) / stride)`, or an error when
    /// the kernel no longer fits in the input.
    pub fn output_length(&self, input_length: usize) -> Result<usize, CtcError> {
        if self.stride == 0 {
            return Err(CtcError::config("conv stride must be positive"));
        }
        if self.kernel_size == 0 || input_length < self.kernel_size {
            return Err(CtcError::sequence_length(format!(
                "conv kernel {} does not fit in {input_length} input frames",
                self.kernel_size
            )));
        }
        Ok(1 + (input_length - self.kernel_size) / self.stride)
    }
}

/// Number of encoder time-steps produced from `input_length` raw samples.
pub fn project_length(
    input_length: usize,
    descriptors: &[ConvDescriptor],
) -> Result<usize, CtcError> {
    descriptors
        .iter()
        .try_fold(input_length, |len, conv| conv.output_length(len))
}

/// Per-example variant of [`project_length`] for variable-length batches.
pub fn project_lengths(
    input_lengths: &[usize],
    descriptors: &[ConvDescriptor],
) -> Result<Vec<usize>, CtcError> {
    input_lengths
        .iter()
        .enumerate()
        .map(|(idx, &len)| project_length(len, descriptors).map_err(|e| e.in_example(idx)))
        .collect()
}
