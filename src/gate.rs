//! Spatial attention gate: two-path gated fusion of same-shape feature maps.

use tch::{nn, Tensor};

use crate::error::{FusionError, Result};

/// Soft feature gate over two feature maps of identical shape.
///
/// Input:  g, x each (batch, in_channels, h, w)
/// Output: (batch, in_channels, h, w)
///
/// Each input is projected by a 1x1 convolution + BatchNorm to a common
/// intermediate width; the projections are summed, passed through ReLU,
/// reduced to a single-channel mask by another 1x1 convolution + BatchNorm +
/// sigmoid, and x is multiplied elementwise by the broadcast mask. Where the
/// mask is near 0 the contribution of x is suppressed; near 1 it passes
/// through unchanged.
#[derive(Debug)]
pub struct SpatialAttentionGate {
    gate_proj: nn::Conv2D,
    gate_norm: nn::BatchNorm,
    input_proj: nn::Conv2D,
    input_norm: nn::BatchNorm,
    mask_proj: nn::Conv2D,
    mask_norm: nn::BatchNorm,
}

impl SpatialAttentionGate {
    /// # Errors
    ///
    /// Returns a configuration error for non-positive channel widths.
    pub fn new(vs: &nn::Path, in_channels: i64, inter_channels: i64) -> Result<Self> {
        if in_channels <= 0 || inter_channels <= 0 {
            return Err(FusionError::config(
                "gate channel widths must be positive",
            ));
        }
        let proj_config = nn::ConvConfig {
            bias: false,
            ..Default::default()
        };
        let gate_proj = nn::conv2d(vs / "gate_proj", in_channels, inter_channels, 1, proj_config);
        let gate_norm = nn::batch_norm2d(vs / "gate_norm", inter_channels, Default::default());
        let input_proj = nn::conv2d(vs / "input_proj", in_channels, inter_channels, 1, proj_config);
        let input_norm = nn::batch_norm2d(vs / "input_norm", inter_channels, Default::default());
        let mask_proj = nn::conv2d(vs / "mask_proj", inter_channels, 1, 1, proj_config);
        let mask_norm = nn::batch_norm2d(vs / "mask_norm", 1, Default::default());

        Ok(SpatialAttentionGate {
            gate_proj,
            gate_norm,
            input_proj,
            input_norm,
            mask_proj,
            mask_norm,
        })
    }

    pub fn forward(&self, g: &Tensor, x: &Tensor, train: bool) -> Tensor {
        let g_proj = g.apply(&self.gate_proj).apply_t(&self.gate_norm, train);
        let x_proj = x.apply(&self.input_proj).apply_t(&self.input_norm, train);
        let mask = (g_proj + x_proj)
            .relu()
            .apply(&self.mask_proj)
            .apply_t(&self.mask_norm, train)
            .sigmoid();
        x * mask
    }
}
