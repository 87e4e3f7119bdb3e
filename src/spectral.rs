//! 3D multi-scale spectral-spatial feature extractor.
//!
//! Three stages of parallel conv3d towers with different kernel depths but
//! matched padding, concatenated along the channel axis, then adaptively
//! pooled and folded from 3D into a 2D feature map.

use tch::{nn, Tensor};

use crate::error::{FusionError, Result};

/// Output channels of each tower per stage; stage concat widths are
/// 12 / 48 / 192 regardless of the band-count regime.
const TOWER_CHANNELS: [i64; 3] = [4, 16, 64];

const STAGE1_KERNEL_DEPTHS: [i64; 3] = [7, 5, 3];
const STAGE2_KERNEL_DEPTHS: [i64; 3] = [5, 3, 1];

/// Kernel-depth regime for the third stage.
///
/// The regime is a policy knob selected from the spectral band count; it
/// changes stage-3 kernel depths only, never channel counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralBandPolicy {
    /// Wide-band inputs (band count above the threshold).
    Wide,
    /// Narrow-band inputs.
    Narrow,
}

impl SpectralBandPolicy {
    /// Selects the regime: `Wide` when `bands` exceeds `threshold`.
    #[must_use]
    pub fn for_band_count(bands: i64, threshold: i64) -> Self {
        if bands > threshold {
            Self::Wide
        } else {
            Self::Narrow
        }
    }

    /// Stage-3 tower kernel depths for this regime.
    #[must_use]
    pub fn stage3_kernel_depths(&self) -> [i64; 3] {
        match self {
            Self::Wide => [7, 5, 3],
            Self::Narrow => [3, 3, 1],
        }
    }
}

/// One conv3d + BatchNorm3d + ReLU tower layer.
///
/// Spatial kernel is 3 with padding 1; the depth kernel varies per tower with
/// padding (depth - 1) / 2, so every tower in a stage produces the same
/// output shape.
#[derive(Debug)]
pub struct SpectralConvLayer {
    convolution: nn::Conv3D,
    normalization: nn::BatchNorm,
}

impl SpectralConvLayer {
    pub fn new(vs: &nn::Path, in_channels: i64, out_channels: i64, kernel_depth: i64) -> Self {
        let conv_config = nn::ConvConfigND::<[i64; 3]> {
            stride: [1, 1, 1],
            padding: [(kernel_depth - 1) / 2, 1, 1],
            dilation: [1, 1, 1],
            groups: 1,
            bias: false,
            ws_init: nn::init::DEFAULT_KAIMING_UNIFORM,
            bs_init: nn::Init::Const(0.),
            padding_mode: nn::PaddingMode::Zeros,
        };
        let convolution = nn::conv(
            vs / "convolution",
            in_channels,
            out_channels,
            [kernel_depth, 3, 3],
            conv_config,
        );
        let normalization =
            nn::batch_norm3d(vs / "normalization", out_channels, Default::default());

        SpectralConvLayer {
            convolution,
            normalization,
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        x.apply(&self.convolution)
            .apply_t(&self.normalization, train)
            .relu()
    }
}

/// Three parallel towers concatenated along the channel axis.
#[derive(Debug)]
struct SpectralStage {
    towers: Vec<SpectralConvLayer>,
}

impl SpectralStage {
    fn new(vs: &nn::Path, in_channels: i64, tower_channels: i64, kernel_depths: [i64; 3]) -> Self {
        let towers = kernel_depths
            .iter()
            .enumerate()
            .map(|(index, &depth)| {
                SpectralConvLayer::new(
                    &(vs / "towers" / (index as i64)),
                    in_channels,
                    tower_channels,
                    depth,
                )
            })
            .collect();
        SpectralStage { towers }
    }

    fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let outputs: Vec<Tensor> = self
            .towers
            .iter()
            .map(|tower| tower.forward(x, train))
            .collect();
        Tensor::cat(&outputs, 1)
    }
}

/// 3D multi-scale spectral-spatial block.
///
/// Input:  (batch, 1, depth, h, w) with depth >= 7
/// Output: (batch, 192 * pooled_depth, pooled_h, pooled_w)
///
/// After the third stage an adaptive average pool reduces the volume to
/// `pooled` extents and the remaining depth axis is folded into the channel
/// axis by reshape.
#[derive(Debug)]
pub struct MultiScaleSpectralBlock {
    stage1: SpectralStage,
    stage2: SpectralStage,
    stage3: SpectralStage,
    pooled: [i64; 3],
}

impl MultiScaleSpectralBlock {
    /// # Errors
    ///
    /// Returns a configuration error if `num_bands` is smaller than the
    /// largest stage-1 kernel depth or any pooled extent is non-positive.
    pub fn new(
        vs: &nn::Path,
        num_bands: i64,
        policy: SpectralBandPolicy,
        pooled: [i64; 3],
    ) -> Result<Self> {
        let max_depth = STAGE1_KERNEL_DEPTHS[0];
        if num_bands < max_depth {
            return Err(FusionError::config(format!(
                "num_bands {num_bands} is smaller than the largest kernel depth {max_depth}"
            )));
        }
        if pooled.iter().any(|&extent| extent <= 0) {
            return Err(FusionError::config("pooled extents must be positive"));
        }

        let stage1 = SpectralStage::new(&(vs / "stage1"), 1, TOWER_CHANNELS[0], STAGE1_KERNEL_DEPTHS);
        let stage2 = SpectralStage::new(
            &(vs / "stage2"),
            3 * TOWER_CHANNELS[0],
            TOWER_CHANNELS[1],
            STAGE2_KERNEL_DEPTHS,
        );
        let stage3 = SpectralStage::new(
            &(vs / "stage3"),
            3 * TOWER_CHANNELS[1],
            TOWER_CHANNELS[2],
            policy.stage3_kernel_depths(),
        );

        Ok(MultiScaleSpectralBlock {
            stage1,
            stage2,
            stage3,
            pooled,
        })
    }

    /// Channel count of the folded 2D output.
    #[must_use]
    pub fn out_channels(&self) -> i64 {
        3 * TOWER_CHANNELS[2] * self.pooled[0]
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let features = self.stage1.forward(x, train);
        let features = self.stage2.forward(&features, train);
        let features = self.stage3.forward(&features, train);

        let pooled = features.adaptive_avg_pool3d(self.pooled);
        let size = pooled.size();
        let (batch, channels, depth) = (size[0], size[1], size[2]);
        // Fold the reduced depth axis into channels: (B, C, d, h, w) -> (B, C*d, h, w)
        pooled.view([batch, channels * depth, self.pooled[1], self.pooled[2]])
    }
}
