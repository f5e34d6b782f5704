use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ctc::length::ConvDescriptor;
use crate::error::CtcError;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// How per-example losses are folded into one training scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossReduction {
    #[default]
    Sum,
    Mean,
}

impl LossReduction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CtcError> {
        match value {
            "sum" => Ok(Self::Sum),
            "mean" => Ok(Self::Mean),
            other => Err(CtcError::config(format!(
                "loss_reduction must be `mean` or `sum`, got `{other}`"
            ))),
        }
    }
}

impl fmt::Display for LossReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat on-disk record of the wav2vec2 hyperparameters.
///
/// Missing keys fall back to the base-model defaults. Nothing here is
/// validated; convert into [`Wav2Vec2Config`] for that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wav2Vec2ConfigRecord {
    pub vocab_size: usize,
    pub dropout: f64,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub intermediate_size: usize,
    pub is_gelu_approx: bool,
    pub layer_norm_eps: f64,
    pub layer_drop: f64,
    pub pad_id: usize,
    pub blank_id: usize,
    pub loss_reduction: String,

    pub num_conv_pos_embeddings: usize,
    pub num_conv_pos_embedding_groups: usize,

    pub filter_sizes: Vec<usize>,
    #[serde(alias = "kernal_sizes")]
    pub kernel_sizes: Vec<usize>,
    pub strides: Vec<usize>,
    pub conv_bias: bool,

    pub apply_spec_augment: bool,
    pub mask_time_prob: f64,
    pub mask_time_length: usize,
}

impl Default for Wav2Vec2ConfigRecord {
    fn default() -> Self {
        Self {
            vocab_size: 32,
            dropout: 0.1,
            hidden_size: 768,
            num_heads: 12,
            num_layers: 12,
            intermediate_size: 3072,
            is_gelu_approx: false,
            layer_norm_eps: 1e-5,
            layer_drop: 0.1,
            pad_id: 0,
            blank_id: 0,
            loss_reduction: LossReduction::Sum.as_str().to_string(),
            num_conv_pos_embeddings: 128,
            num_conv_pos_embedding_groups: 16,
            filter_sizes: vec![512; 7],
            kernel_sizes: vec![10, 3, 3, 3, 3, 2, 2],
            strides: vec![5, 2, 2, 2, 2, 2, 2],
            conv_bias: false,
            apply_spec_augment: false,
            mask_time_prob: 0.05,
            mask_time_length: 10,
        }
    }
}

/// Validated, immutable hyperparameter set shared by reference with the loss.
#[derive(Debug, Clone, PartialEq)]
pub struct Wav2Vec2Config {
    record: Wav2Vec2ConfigRecord,
    loss_reduction: LossReduction,
}

impl Wav2Vec2Config {
    pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 16_000;

    pub fn new(record: Wav2Vec2ConfigRecord) -> Result<Self, CtcError> {
        Self::try_from(record)
    }

    pub fn from_json(path: impl AsRef<Path>) -> Result<Self, CtcError> {
        let path = path.as_ref();
        let data =
            std::fs::read_to_string(path).map_err(|e| CtcError::io("read config.json", e))?;
        let record: Wav2Vec2ConfigRecord =
            serde_json::from_str(&data).map_err(|e| CtcError::json("parse config.json", e))?;
        let config = Self::try_from(record)?;
        tracing::info!(path = %path.display(), "loaded wav2vec2 config");
        Ok(config)
    }

    /// Writes `config.json` into `save_dir`, creating the directory if needed.
    pub fn save_pretrained(&self, save_dir: impl AsRef<Path>) -> Result<(), CtcError> {
        let save_dir = save_dir.as_ref();
        std::fs::create_dir_all(save_dir)
            .map_err(|e| CtcError::io("create config directory", e))?;
        let path = save_dir.join(CONFIG_FILE_NAME);
        let data = serde_json::to_string_pretty(&self.record)
            .map_err(|e| CtcError::json("serialize config.json", e))?;
        std::fs::write(&path, data).map_err(|e| CtcError::io("write config.json", e))?;
        tracing::info!(path = %path.display(), "saved wav2vec2 config");
        Ok(())
    }

    pub fn record(&self) -> &Wav2Vec2ConfigRecord {
        &self.record
    }

    pub fn to_record(&self) -> Wav2Vec2ConfigRecord {
        self.record.clone()
    }

    pub fn vocab_size(&self) -> usize {
        self.record.vocab_size
    }

    pub fn pad_id(&self) -> usize {
        self.record.pad_id
    }

    pub fn blank_id(&self) -> usize {
        self.record.blank_id
    }

    /// Padding and the CTC blank share one id, so a label with that id can
    /// only be told apart from padding by its position.
    pub fn pad_is_blank(&self) -> bool {
        self.record.pad_id == self.record.blank_id
    }

    pub fn loss_reduction(&self) -> LossReduction {
        self.loss_reduction
    }

    pub fn head_dim(&self) -> usize {
        self.record.hidden_size / self.record.num_heads
    }

    pub fn conv_descriptors(&self) -> Vec<ConvDescriptor> {
        self.record
            .kernel_sizes
            .iter()
            .zip(&self.record.strides)
            .map(|(&kernel_size, &stride)| ConvDescriptor::new(kernel_size, stride))
            .collect()
    }

    /// Input samples advanced per output frame of the conv stack.
    pub fn total_stride(&self) -> usize {
        self.record.strides.iter().product()
    }

    pub fn frame_stride_ms(&self, sample_rate: u32) -> f64 {
        self.total_stride() as f64 / sample_rate as f64 * 1000.0
    }
}

impl Default for Wav2Vec2Config {
    fn default() -> Self {
        Self {
            record: Wav2Vec2ConfigRecord::default(),
            loss_reduction: LossReduction::Sum,
        }
    }
}

impl TryFrom<Wav2Vec2ConfigRecord> for Wav2Vec2Config {
    type Error = CtcError;

    fn try_from(record: Wav2Vec2ConfigRecord) -> Result<Self, Self::Error> {
        let n = record.filter_sizes.len();
        if record.kernel_sizes.len() != n || record.strides.len() != n {
            return Err(CtcError::config(format!(
                "len of filter_sizes ({n}), kernel_sizes ({}), strides ({}) must match",
                record.kernel_sizes.len(),
                record.strides.len()
            )));
        }
        if n == 0 {
            return Err(CtcError::config("conv feature extractor needs at least one layer"));
        }
        if let Some(i) = record.kernel_sizes.iter().position(|&k| k == 0) {
            return Err(CtcError::config(format!("kernel_sizes[{i}] must be positive")));
        }
        if let Some(i) = record.strides.iter().position(|&s| s == 0) {
            return Err(CtcError::config(format!("strides[{i}] must be positive")));
        }
        if record.num_heads == 0 || record.hidden_size % record.num_heads != 0 {
            return Err(CtcError::config(format!(
                "hidden_size ({}) must be a multiple of num_heads ({})",
                record.hidden_size, record.num_heads
            )));
        }
        if record.vocab_size == 0 {
            return Err(CtcError::config("vocab_size must be positive"));
        }
        if record.blank_id >= record.vocab_size {
            return Err(CtcError::config(format!(
                "blank_id ({}) must be below vocab_size ({})",
                record.blank_id, record.vocab_size
            )));
        }
        for (name, p) in [
            ("dropout", record.dropout),
            ("layer_drop", record.layer_drop),
            ("mask_time_prob", record.mask_time_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(CtcError::config(format!("{name} must be in [0, 1], got {p}")));
            }
        }
        let loss_reduction = LossReduction::parse(&record.loss_reduction)?;

        let config = Self {
            record,
            loss_reduction,
        };
        if config.pad_is_blank() {
            tracing::warn!(
                pad_id = config.record.pad_id,
                "pad_id equals blank_id; labels carrying that id inside a sequence are rejected"
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Wav2Vec2Config::new(Wav2Vec2ConfigRecord::default()).unwrap();
        assert_eq!(config, Wav2Vec2Config::default());
        assert_eq!(config.loss_reduction(), LossReduction::Sum);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.conv_descriptors().len(), 7);
        assert_eq!(config.conv_descriptors()[0], ConvDescriptor::new(10, 5));
    }

    #[test]
    fn frame_stride_ms_matches_base_model() {
        let config = Wav2Vec2Config::default();
        // 5 * 2^6 = 320 samples, 320 / 16000 * 1000 = 20 ms
        assert_eq!(config.total_stride(), 320);
        let stride_ms = config.frame_stride_ms(Wav2Vec2Config::DEFAULT_SAMPLE_RATE_HZ);
        assert!((stride_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_mismatched_conv_lists() {
        let record = Wav2Vec2ConfigRecord {
            strides: vec![5, 2],
            ..Default::default()
        };
        let err = Wav2Vec2Config::new(record).unwrap_err();
        assert!(matches!(err, CtcError::ConfigValidation { .. }));
    }

    #[test]
    fn rejects_indivisible_hidden_size() {
        let record = Wav2Vec2ConfigRecord {
            hidden_size: 770,
            ..Default::default()
        };
        assert!(matches!(
            Wav2Vec2Config::new(record),
            Err(CtcError::ConfigValidation { .. })
        ));
    }

    #[test]
    fn rejects_unknown_reduction() {
        let record = Wav2Vec2ConfigRecord {
            loss_reduction: "median".to_string(),
            ..Default::default()
        };
        let err = Wav2Vec2Config::new(record).unwrap_err();
        assert!(err.to_string().contains("median"));
    }

    #[test]
    fn rejects_zero_stride_and_blank_outside_vocab() {
        let record = Wav2Vec2ConfigRecord {
            strides: vec![5, 2, 2, 0, 2, 2, 2],
            ..Default::default()
        };
        assert!(Wav2Vec2Config::new(record).is_err());

        let record = Wav2Vec2ConfigRecord {
            blank_id: 32,
            ..Default::default()
        };
        assert!(Wav2Vec2Config::new(record).is_err());
    }

    #[test]
    fn reads_legacy_kernal_sizes_key_and_defaults() {
        let json = r#"{
            "vocab_size": 40,
            "pad_id": 3,
            "blank_id": 3,
            "loss_reduction": "mean",
            "filter_sizes": [512, 512],
            "kernal_sizes": [10, 3],
            "strides": [5, 2]
        }"#;
        let record: Wav2Vec2ConfigRecord = serde_json::from_str(json).expect("valid json");
        let config = Wav2Vec2Config::new(record).unwrap();
        assert_eq!(config.vocab_size(), 40);
        assert_eq!(config.pad_id(), 3);
        assert_eq!(config.loss_reduction(), LossReduction::Mean);
        assert_eq!(config.record().kernel_sizes, vec![10, 3]);
        assert_eq!(config.record().hidden_size, 768);
    }

    #[test]
    fn save_then_load_revalidates() {
        let dir = std::env::temp_dir().join("wav2vec2_ctc_config_roundtrip");
        let record = Wav2Vec2ConfigRecord {
            loss_reduction: "mean".to_string(),
            pad_id: 31,
            ..Default::default()
        };
        let config = Wav2Vec2Config::new(record).unwrap();
        config.save_pretrained(&dir).expect("save config");

        let loaded = Wav2Vec2Config::from_json(dir.join(CONFIG_FILE_NAME)).expect("load config");
        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_fails_on_invalid_file_contents() {
        let path = std::env::temp_dir().join("wav2vec2_ctc_config_invalid.json");
        std::fs::write(&path, r#"{"hidden_size": 100, "num_heads": 12}"#).expect("write config");
        assert!(matches!(
            Wav2Vec2Config::from_json(&path),
            Err(CtcError::ConfigValidation { .. })
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pad_and_blank_ids_are_independent() {
        assert!(Wav2Vec2Config::default().pad_is_blank());

        let record = Wav2Vec2ConfigRecord {
            pad_id: 31,
            blank_id: 0,
            ..Default::default()
        };
        let config = Wav2Vec2Config::new(record).unwrap();
        assert!(!config.pad_is_blank());
        assert_eq!(config.pad_id(), 31);
        assert_eq!(config.blank_id(), 0);
    }

    #[test]
    fn load_fails_on_missing_path() {
        assert!(matches!(
            Wav2Vec2Config::from_json("/nonexistent/config.json"),
            Err(CtcError::Io { .. })
        ));
    }
}
