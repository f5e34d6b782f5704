use candle_core::{DType, Device, Tensor};

use crate::error::CtcError;
use crate::types::{LabelBatch, LogitBatch};

/// Copies `(batch, time, vocab)` logits of any float dtype to host memory.
pub fn logits_from_tensor(logits: &Tensor) -> Result<LogitBatch, CtcError> {
    logits
        .dims3()
        .map_err(|e| CtcError::tensor("logits shape", e))?;
    logits
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec3::<f32>())
        .map_err(|e| CtcError::tensor("logits to_vec3", e))
}

/// Copies `(batch, max_label_len)` integer labels to host memory.
pub fn labels_from_tensor(labels: &Tensor) -> Result<LabelBatch, CtcError> {
    labels
        .dims2()
        .map_err(|e| CtcError::tensor("labels shape", e))?;
    let rows = labels
        .to_dtype(DType::I64)
        .and_then(|t| t.to_vec2::<i64>())
        .map_err(|e| CtcError::tensor("labels to_vec2", e))?;
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|id| {
                    usize::try_from(id)
                        .map_err(|_| CtcError::invalid_input(format!("negative label id {id}")))
                })
                .collect::<Result<Vec<usize>, CtcError>>()
        })
        .collect()
}

pub fn gradients_to_tensor(gradient: &LogitBatch, device: &Device) -> Result<Tensor, CtcError> {
    let batch = gradient.len();
    let time = gradient.first().map_or(0, Vec::len);
    let vocab = gradient
        .first()
        .and_then(|x| x.first())
        .map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(batch * time * vocab);
    for (idx, example) in gradient.iter().enumerate() {
        if example.len() != time || example.iter().any(|row| row.len() != vocab) {
            return Err(CtcError::invalid_input(format!(
                "gradient of example {idx} is not {time}x{vocab}"
            )));
        }
        flat.extend(example.iter().flatten().copied());
    }
    Tensor::from_vec(flat, (batch, time, vocab), device)
        .map_err(|e| CtcError::tensor("gradient tensor creation", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logits_roundtrip_through_host() {
        let data: Vec<f32> = (0..24).map(|x| x as f32 * 0.5).collect();
        let tensor = Tensor::from_vec(data, (2, 3, 4), &Device::Cpu).unwrap();
        let host = logits_from_tensor(&tensor).unwrap();
        assert_eq!(host.len(), 2);
        assert_eq!(host[1][2], vec![10.0, 10.5, 11.0, 11.5]);

        let back = gradients_to_tensor(&host, &Device::Cpu).unwrap();
        assert_eq!(back.dims3().unwrap(), (2, 3, 4));
    }

    #[test]
    fn logits_must_be_rank_three() {
        let tensor = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            logits_from_tensor(&tensor),
            Err(CtcError::Tensor { .. })
        ));
    }

    #[test]
    fn labels_accept_integer_dtypes() {
        let tensor = Tensor::new(&[[1u32, 2, 0], [3, 0, 0]], &Device::Cpu).unwrap();
        assert_eq!(
            labels_from_tensor(&tensor).unwrap(),
            vec![vec![1, 2, 0], vec![3, 0, 0]]
        );
        let tensor = Tensor::new(&[[1i64, -1]], &Device::Cpu).unwrap();
        assert!(matches!(
            labels_from_tensor(&tensor),
            Err(CtcError::InvalidInput { .. })
        ));
    }

    #[test]
    fn ragged_gradient_is_rejected() {
        let gradient = vec![vec![vec![0.0; 2]; 3], vec![vec![0.0; 2]; 2]];
        assert!(gradients_to_tensor(&gradient, &Device::Cpu).is_err());
    }
}
