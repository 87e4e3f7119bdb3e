//! Construction-time configuration for the fusion network.
//!
//! Every cross-component width and per-stage hyperparameter is explicit here
//! and validated by [`FusionConfig::validate`] before any layer variables are
//! registered, so invalid setups fail at construction rather than at the
//! first forward call.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};
use crate::transformer::Activation;

/// Full configuration for [`crate::FusionNetwork`].
///
/// Per-stage vectors (`embed_dims`, `group_counts`, `num_heads`,
/// `mlp_ratios`, `stage_depths`) must all have the same length; that length
/// is the number of transformer stages.
///
/// The default configuration matches the reference setup: 13x13 patches,
/// 200 spectral bands, 3 stages with embedding dims [256, 128, 64],
/// 10 output classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Spatial extent of the input patch (height == width).
    pub image_size: i64,
    /// Number of spectral bands in the primary input.
    pub num_bands: i64,
    /// Number of output classes.
    pub num_classes: i64,
    /// Token embedding dimension per stage.
    pub embed_dims: Vec<i64>,
    /// Group count for the grouped pixel-embedding convolution per stage.
    pub group_counts: Vec<i64>,
    /// Attention head count per stage; must divide the stage embedding dim.
    pub num_heads: Vec<i64>,
    /// MLP hidden-width expansion ratio per stage.
    pub mlp_ratios: Vec<f64>,
    /// Number of transformer blocks per stage.
    pub stage_depths: Vec<i64>,
    /// Activation used inside the MLP blocks.
    pub activation: Activation,
    /// Dropout probability for MLP and attention output projections.
    pub dropout: f64,
    /// Dropout probability on the attention weights.
    pub attn_dropout: f64,
    /// Output channels of each morphological branch.
    pub branch_channels: i64,
    /// Common channel width the six branch outputs are remapped to.
    pub fused_channels: i64,
    /// Target extent of the adaptive pooling on the morphological descriptor.
    pub morph_pool_size: i64,
    /// Band count above which the 3D spectral block selects the wide-band
    /// kernel-depth regime. A policy constant, not a physical law.
    pub wide_band_threshold: i64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            image_size: 13,
            num_bands: 200,
            num_classes: 10,
            embed_dims: vec![256, 128, 64],
            group_counts: vec![4, 4, 4],
            num_heads: vec![8, 8, 8],
            mlp_ratios: vec![1.0, 1.0, 1.0],
            stage_depths: vec![2, 2, 2],
            activation: Activation::GELU,
            dropout: 0.1,
            attn_dropout: 0.0,
            branch_channels: 16,
            fused_channels: 64,
            morph_pool_size: 1,
            wide_band_threshold: 100,
        }
    }
}

impl FusionConfig {
    /// Returns a builder initialized with the default configuration.
    #[must_use]
    pub fn builder() -> FusionConfigBuilder {
        FusionConfigBuilder::new()
    }

    /// Number of transformer stages.
    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.embed_dims.len()
    }

    /// Band count after replication padding up to the next multiple of the
    /// first stage's group count.
    #[must_use]
    pub fn padded_bands(&self) -> i64 {
        let groups = self.group_counts[0];
        let rem = self.num_bands % groups;
        if rem == 0 {
            self.num_bands
        } else {
            self.num_bands + groups - rem
        }
    }

    /// Loads a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::ParseError`] on malformed JSON and
    /// [`FusionError::ConfigError`] if the parsed values are invalid.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::IoError`] if the file cannot be read, plus the
    /// errors of [`FusionConfig::from_json_str`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Validates structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::ConfigError`] describing the first violated
    /// invariant.
    pub fn validate(&self) -> Result<()> {
        if self.image_size <= 0 {
            return Err(FusionError::config("image_size must be positive"));
        }
        if self.num_bands <= 0 {
            return Err(FusionError::config("num_bands must be positive"));
        }
        if self.num_classes <= 0 {
            return Err(FusionError::config("num_classes must be positive"));
        }
        let stages = self.embed_dims.len();
        if stages == 0 {
            return Err(FusionError::config("at least one stage is required"));
        }
        if self.group_counts.first().is_some_and(|&g| g > self.num_bands) {
            return Err(FusionError::config(format!(
                "stage 0 group count {} exceeds band count {}; replication \
                 padding cannot reach a full group",
                self.group_counts[0], self.num_bands
            )));
        }
        for (name, len) in [
            ("group_counts", self.group_counts.len()),
            ("num_heads", self.num_heads.len()),
            ("mlp_ratios", self.mlp_ratios.len()),
            ("stage_depths", self.stage_depths.len()),
        ] {
            if len != stages {
                return Err(FusionError::config(format!(
                    "{name} has length {len} but there are {stages} stages"
                )));
            }
        }
        for stage in 0..stages {
            let embed = self.embed_dims[stage];
            let groups = self.group_counts[stage];
            let heads = self.num_heads[stage];
            if embed <= 0 || groups <= 0 || heads <= 0 {
                return Err(FusionError::config(format!(
                    "stage {stage}: embed_dim, group count and head count must be positive"
                )));
            }
            if embed % heads != 0 {
                return Err(FusionError::config(format!(
                    "stage {stage}: embed_dim {embed} not divisible by {heads} heads"
                )));
            }
            if embed % groups != 0 {
                return Err(FusionError::config(format!(
                    "stage {stage}: embed_dim {embed} not divisible by group count {groups}"
                )));
            }
            // Stage 0 input channels are padded up to a multiple of the group
            // count; later stages consume the previous stage's embedding.
            if stage > 0 && self.embed_dims[stage - 1] % groups != 0 {
                return Err(FusionError::config(format!(
                    "stage {stage}: input width {} not divisible by group count {groups}",
                    self.embed_dims[stage - 1]
                )));
            }
            if self.stage_depths[stage] <= 0 {
                return Err(FusionError::config(format!(
                    "stage {stage}: depth must be positive"
                )));
            }
            if self.mlp_ratios[stage] <= 0.0 {
                return Err(FusionError::config(format!(
                    "stage {stage}: mlp_ratio must be positive"
                )));
            }
        }
        for (name, p) in [("dropout", self.dropout), ("attn_dropout", self.attn_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return Err(FusionError::config(format!("{name} must be in [0, 1)")));
            }
        }
        if self.branch_channels <= 0 {
            return Err(FusionError::config("branch_channels must be positive"));
        }
        if self.fused_channels <= 0 {
            return Err(FusionError::config("fused_channels must be positive"));
        }
        if self.morph_pool_size <= 0 {
            return Err(FusionError::config("morph_pool_size must be positive"));
        }
        if self.morph_pool_size > self.image_size {
            return Err(FusionError::config(format!(
                "morph_pool_size {} exceeds image_size {}",
                self.morph_pool_size, self.image_size
            )));
        }
        if self.wide_band_threshold <= 0 {
            return Err(FusionError::config("wide_band_threshold must be positive"));
        }
        Ok(())
    }
}

/// Builder for [`FusionConfig`] with a validating [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct FusionConfigBuilder {
    config: FusionConfig,
}

impl FusionConfigBuilder {
    /// Creates a builder seeded with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the spatial extent of the input patch.
    #[must_use = "returns the builder with image size configured"]
    pub fn image_size(mut self, size: i64) -> Self {
        self.config.image_size = size;
        self
    }

    /// Set the spectral band count of the primary input.
    #[must_use = "returns the builder with band count configured"]
    pub fn num_bands(mut self, bands: i64) -> Self {
        self.config.num_bands = bands;
        self
    }

    /// Set the number of output classes.
    #[must_use = "returns the builder with class count configured"]
    pub fn num_classes(mut self, classes: i64) -> Self {
        self.config.num_classes = classes;
        self
    }

    /// Set all per-stage hyperparameters at once. The vector lengths define
    /// the stage count and must agree.
    #[must_use = "returns the builder with stage parameters configured"]
    pub fn stages(
        mut self,
        embed_dims: Vec<i64>,
        group_counts: Vec<i64>,
        num_heads: Vec<i64>,
        mlp_ratios: Vec<f64>,
        stage_depths: Vec<i64>,
    ) -> Self {
        self.config.embed_dims = embed_dims;
        self.config.group_counts = group_counts;
        self.config.num_heads = num_heads;
        self.config.mlp_ratios = mlp_ratios;
        self.config.stage_depths = stage_depths;
        self
    }

    /// Set the MLP activation.
    #[must_use = "returns the builder with activation configured"]
    pub fn activation(mut self, activation: Activation) -> Self {
        self.config.activation = activation;
        self
    }

    /// Set the projection/MLP dropout probability.
    #[must_use = "returns the builder with dropout configured"]
    pub fn dropout(mut self, p: f64) -> Self {
        self.config.dropout = p;
        self
    }

    /// Set the attention-weight dropout probability.
    #[must_use = "returns the builder with attention dropout configured"]
    pub fn attn_dropout(mut self, p: f64) -> Self {
        self.config.attn_dropout = p;
        self
    }

    /// Set the morphological branch widths and pooled extent.
    #[must_use = "returns the builder with morphological widths configured"]
    pub fn morphology(mut self, branch_channels: i64, fused_channels: i64, pool_size: i64) -> Self {
        self.config.branch_channels = branch_channels;
        self.config.fused_channels = fused_channels;
        self.config.morph_pool_size = pool_size;
        self
    }

    /// Set the wide-band regime threshold for the 3D spectral block.
    #[must_use = "returns the builder with band threshold configured"]
    pub fn wide_band_threshold(mut self, threshold: i64) -> Self {
        self.config.wide_band_threshold = threshold;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::ConfigError`] if any invariant is violated.
    pub fn build(self) -> Result<FusionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FusionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_stages(), 3);
        // 200 bands already divisible by 4 groups
        assert_eq!(config.padded_bands(), 200);
    }

    #[test]
    fn test_padded_bands_rounds_up() {
        let config = FusionConfigBuilder::new()
            .num_bands(103)
            .build()
            .expect("valid config");
        assert_eq!(config.padded_bands(), 104);
    }

    #[test]
    fn test_heads_must_divide_embed_dim() {
        let err = FusionConfigBuilder::new()
            .stages(
                vec![256, 128, 64],
                vec![4, 4, 4],
                vec![8, 8, 7], // 64 % 7 != 0
                vec![1.0, 1.0, 1.0],
                vec![2, 2, 2],
            )
            .build()
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("not divisible by 7 heads"));
    }

    #[test]
    fn test_stage_vector_lengths_must_agree() {
        let err = FusionConfigBuilder::new()
            .stages(
                vec![256, 128],
                vec![4, 4, 4],
                vec![8, 8],
                vec![1.0, 1.0],
                vec![2, 2],
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("group_counts"));
    }

    #[test]
    fn test_groups_must_divide_stage_input() {
        // Stage 1 consumes the 250-wide stage-0 embedding; 250 % 4 != 0.
        let err = FusionConfigBuilder::new()
            .stages(
                vec![250, 128],
                vec![4, 4],
                vec![5, 8],
                vec![1.0, 1.0],
                vec![1, 1],
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("not divisible by group count"));
    }

    #[test]
    fn test_dropout_range_checked() {
        let err = FusionConfigBuilder::new().dropout(1.0).build().unwrap_err();
        assert!(err.to_string().contains("dropout"));
    }

    #[test]
    fn test_json_round_trip() {
        let config = FusionConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed = FusionConfig::from_json_str(&json).expect("parse");
        assert_eq!(parsed.embed_dims, config.embed_dims);
        assert_eq!(parsed.activation, config.activation);
        assert_eq!(parsed.wide_band_threshold, 100);
    }

    #[test]
    fn test_json_rejects_invalid_values() {
        let json = r#"{
            "image_size": 13, "num_bands": 200, "num_classes": 0,
            "embed_dims": [64], "group_counts": [4], "num_heads": [8],
            "mlp_ratios": [1.0], "stage_depths": [1],
            "activation": "gelu", "dropout": 0.1, "attn_dropout": 0.0,
            "branch_channels": 16, "fused_channels": 64,
            "morph_pool_size": 1, "wide_band_threshold": 100
        }"#;
        let err = FusionConfig::from_json_str(json).unwrap_err();
        assert!(err.is_config_error());
    }
}
