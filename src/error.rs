use thiserror::Error;

#[derive(Debug, Error)]
pub enum CtcError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {message}")]
    ConfigValidation { message: String },
    #[error("invalid sequence length{}: {message}", fmt_example(.example))]
    InvalidSequenceLength {
        example: Option<usize>,
        message: String,
    },
    #[error("numerical instability{}: {message}", fmt_example(.example))]
    NumericalInstability {
        example: Option<usize>,
        message: String,
    },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("division factor must be finite and non-zero")]
    DivideByZero,
    #[error("{context}: {message}")]
    Tensor {
        context: &'static str,
        message: String,
    },
}

fn fmt_example(example: &Option<usize>) -> String {
    match example {
        Some(idx) => format!(" in example {idx}"),
        None => String::new(),
    }
}

impl CtcError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    pub(crate) fn sequence_length(message: impl Into<String>) -> Self {
        Self::InvalidSequenceLength {
            example: None,
            message: message.into(),
        }
    }

    pub(crate) fn numerical(message: impl Into<String>) -> Self {
        Self::NumericalInstability {
            example: None,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn tensor(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Tensor {
            context,
            message: err.to_string(),
        }
    }

    /// Attaches a batch index to per-example errors raised without one.
    pub(crate) fn in_example(self, idx: usize) -> Self {
        match self {
            Self::InvalidSequenceLength {
                example: None,
                message,
            } => Self::InvalidSequenceLength {
                example: Some(idx),
                message,
            },
            Self::NumericalInstability {
                example: None,
                message,
            } => Self::NumericalInstability {
                example: Some(idx),
                message,
            },
            other => other,
        }
    }

    pub fn is_infeasible(&self) -> bool {
        matches!(self, Self::InvalidSequenceLength { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_example_tags_sequence_errors_once() {
        let err = CtcError::sequence_length("too short").in_example(3);
        assert!(err.to_string().contains("in example 3"));
        let err = err.in_example(7);
        assert!(err.to_string().contains("in example 3"));
        assert!(err.is_infeasible());
    }

    #[test]
    fn in_example_leaves_other_variants() {
        let err = CtcError::invalid_input("bad").in_example(1);
        assert_eq!(err.to_string(), "invalid input: bad");
        assert!(!err.is_infeasible());
    }
}
