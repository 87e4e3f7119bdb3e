//! Top-level fusion network: staged transformer pipeline over the spectral
//! input, morphological pipeline over the auxiliary input, concatenated
//! descriptors and a linear classification head.

use tch::{nn, Kind, Tensor};

use crate::config::FusionConfig;
use crate::embedding::GroupedPixelEmbedding;
use crate::error::Result;
use crate::morphology::MorphologicalBranch;
use crate::transformer::TransformerBlock;

/// One transformer stage: pixel embedding, a block list and a final norm.
///
/// Stages are held in an ordered `Vec` and indexed by position; there is no
/// name-based lookup.
#[derive(Debug)]
pub struct FusionStage {
    embedding: GroupedPixelEmbedding,
    blocks: Vec<TransformerBlock>,
    norm: nn::LayerNorm,
}

impl FusionStage {
    /// Runs the stage on a spatial grid, returning the normalized token
    /// sequence and its spatial size.
    fn forward(&self, grid: &Tensor, train: bool) -> (Tensor, i64) {
        let (mut tokens, spatial_size) = self.embedding.forward(grid, train);
        for block in &self.blocks {
            tokens = block.forward(&tokens, train);
        }
        (tokens.apply(&self.norm), spatial_size)
    }
}

/// Multi-branch hyperspectral/LiDAR fusion classification network.
///
/// Forward contract:
/// - primary input (batch, 1, bands, size, size)
/// - auxiliary input (batch, 1, size, size)
/// - output (batch, num_classes) unnormalized logits; softmax is the
///   caller's responsibility.
#[derive(Debug)]
pub struct FusionNetwork {
    config: FusionConfig,
    stages: Vec<FusionStage>,
    morphology: MorphologicalBranch,
    head: nn::Linear,
}

impl FusionNetwork {
    /// Builds the network and registers all variables under `vs`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if [`FusionConfig::validate`] fails or
    /// any module rejects its widths.
    pub fn new(vs: &nn::Path, config: &FusionConfig) -> Result<Self> {
        config.validate()?;

        let num_stages = config.num_stages();
        let mut stages = Vec::with_capacity(num_stages);
        let mut in_channels = config.padded_bands();
        for stage in 0..num_stages {
            let stage_vs = vs / "stages" / (stage as i64);
            let embed_dim = config.embed_dims[stage];
            let embedding = GroupedPixelEmbedding::new(
                &(stage_vs.clone() / "embedding"),
                in_channels,
                embed_dim,
                config.group_counts[stage],
            )?;
            let mut blocks = Vec::with_capacity(config.stage_depths[stage] as usize);
            for block in 0..config.stage_depths[stage] {
                blocks.push(TransformerBlock::new(
                    &(stage_vs.clone() / "blocks" / block),
                    embed_dim,
                    config.num_heads[stage],
                    config.mlp_ratios[stage],
                    config.activation,
                    config.dropout,
                    config.attn_dropout,
                )?);
            }
            let norm = nn::layer_norm(stage_vs / "norm", vec![embed_dim], Default::default());
            stages.push(FusionStage {
                embedding,
                blocks,
                norm,
            });
            in_channels = embed_dim;
        }

        let morphology = MorphologicalBranch::new(
            &(vs / "morphology"),
            1,
            config.branch_channels,
            config.fused_channels,
            config.morph_pool_size,
        )?;

        let head_in = config.embed_dims[num_stages - 1]
            + config.fused_channels * config.morph_pool_size * config.morph_pool_size;
        let head = nn::linear(vs / "head", head_in, config.num_classes, Default::default());

        log::debug!(
            "assembled fusion network: {} stages (embed dims {:?}), {} padded bands, \
             head {} -> {} classes",
            num_stages,
            config.embed_dims,
            config.padded_bands(),
            head_in,
            config.num_classes
        );

        Ok(FusionNetwork {
            config: config.clone(),
            stages,
            morphology,
            head,
        })
    }

    /// Returns the network configuration.
    #[must_use]
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Pads the band axis of (batch, bands, h, w) up to the next multiple of
    /// the first stage's group count by replicating leading bands.
    fn pad_bands(&self, x: &Tensor) -> Tensor {
        let bands = x.size()[1];
        let groups = self.config.group_counts[0];
        let rem = bands % groups;
        if rem == 0 {
            x.shallow_clone()
        } else {
            let pad = groups - rem;
            Tensor::cat(&[x.shallow_clone(), x.narrow(1, 0, pad)], 1)
        }
    }

    /// Forward pass producing (batch, num_classes) logits.
    ///
    /// `spectral` is (batch, 1, bands, size, size); `auxiliary` is
    /// (batch, 1, size, size). Shape mismatches are raised by libtorch and
    /// are fatal for the call.
    pub fn forward(&self, spectral: &Tensor, auxiliary: &Tensor, train: bool) -> Tensor {
        // (B, 1, bands, S, S) -> (B, bands', S, S)
        let mut grid = self.pad_bands(&spectral.squeeze_dim(1));

        // All stages but the last hand a spatial grid to the next embedding.
        let last = self.stages.len() - 1;
        for stage in &self.stages[..last] {
            let (tokens, spatial_size) = stage.forward(&grid, train);
            let channels = tokens.size()[2];
            grid = tokens
                .transpose(1, 2)
                .reshape([-1, channels, spatial_size, spatial_size]);
        }
        let (tokens, _) = self.stages[last].forward(&grid, train);

        // Pooled token descriptor and pooled morphological descriptor.
        let spectral_descriptor = tokens.mean_dim(&[1i64][..], false, Kind::Float);
        let morph_descriptor = self.morphology.forward(auxiliary, train).flatten(1, -1);

        let features = Tensor::cat(&[spectral_descriptor, morph_descriptor], 1);
        features.apply(&self.head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfigBuilder;
    use tch::Device;

    fn small_config() -> FusionConfig {
        FusionConfigBuilder::new()
            .image_size(7)
            .num_bands(10)
            .num_classes(4)
            .stages(
                vec![32, 16],
                vec![2, 2],
                vec![4, 4],
                vec![1.0, 1.0],
                vec![1, 1],
            )
            .morphology(8, 16, 1)
            .build()
            .expect("valid small config")
    }

    #[test]
    fn test_forward_produces_logits() {
        let vs = nn::VarStore::new(Device::Cpu);
        let network = FusionNetwork::new(&vs.root(), &small_config()).expect("valid network");

        let spectral = Tensor::randn([2, 1, 10, 7, 7], tch::kind::FLOAT_CPU);
        let auxiliary = Tensor::randn([2, 1, 7, 7], tch::kind::FLOAT_CPU);
        let logits = network.forward(&spectral, &auxiliary, false);
        assert_eq!(logits.size(), vec![2, 4]);
    }

    #[test]
    fn test_band_padding_replicates_leading_bands() {
        // 10 bands with group count 4 pad up to 12.
        let config = FusionConfigBuilder::new()
            .image_size(7)
            .num_bands(10)
            .num_classes(4)
            .stages(vec![32, 16], vec![4, 2], vec![4, 4], vec![1.0, 1.0], vec![1, 1])
            .morphology(8, 16, 1)
            .build()
            .expect("valid config");
        let vs = nn::VarStore::new(Device::Cpu);
        let network = FusionNetwork::new(&vs.root(), &config).expect("valid network");

        let x = Tensor::arange(10, tch::kind::FLOAT_CPU).view([1, 10, 1, 1]);
        let padded = network.pad_bands(&x);
        assert_eq!(padded.size(), vec![1, 12, 1, 1]);
        // The two extra bands replicate bands 0 and 1.
        assert_eq!(f64::try_from(padded.get(0).get(10).get(0).get(0)).unwrap(), 0.0);
        assert_eq!(f64::try_from(padded.get(0).get(11).get(0).get(0)).unwrap(), 1.0);
    }

    #[test]
    fn test_construction_fails_fast_on_bad_heads() {
        let config = FusionConfigBuilder::new()
            .stages(
                vec![250, 120],
                vec![5, 5],
                vec![7, 8], // 250 % 7 != 0
                vec![1.0, 1.0],
                vec![1, 1],
            )
            .build();
        assert!(config.is_err());
    }

    #[test]
    fn test_train_mode_forward() {
        let vs = nn::VarStore::new(Device::Cpu);
        let network = FusionNetwork::new(&vs.root(), &small_config()).expect("valid network");

        let spectral = Tensor::randn([1, 1, 10, 7, 7], tch::kind::FLOAT_CPU);
        let auxiliary = Tensor::randn([1, 1, 7, 7], tch::kind::FLOAT_CPU);
        let logits = network.forward(&spectral, &auxiliary, true);
        assert_eq!(logits.size(), vec![1, 4]);
    }
}
