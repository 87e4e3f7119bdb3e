//! Grouped pixel embedding: spatial grid to token sequence.

use tch::{nn, Tensor};

use crate::error::{FusionError, Result};

/// Grouped convolutional pixel embedding.
///
/// Input:  (batch, in_channels, size, size)
/// Output: ((batch, size * size, out_channels), size)
///
/// A grouped 3x3 convolution with stride 1 and padding 1 (spatial extent
/// preserved), BatchNorm2d and ReLU, then row-major flattening of the grid
/// into a token sequence with channels moved to the last axis.
///
/// The returned spatial size equals the input size; with this kernel, stride
/// and padding the convolution output has the same extent, so callers can use
/// it to reshape the token sequence back into a grid.
#[derive(Debug)]
pub struct GroupedPixelEmbedding {
    convolution: nn::Conv2D,
    normalization: nn::BatchNorm,
    out_channels: i64,
}

impl GroupedPixelEmbedding {
    /// # Errors
    ///
    /// Returns a configuration error unless `groups` divides both
    /// `in_channels` and `out_channels`.
    pub fn new(vs: &nn::Path, in_channels: i64, out_channels: i64, groups: i64) -> Result<Self> {
        if groups <= 0 || in_channels % groups != 0 || out_channels % groups != 0 {
            return Err(FusionError::config(format!(
                "group count {groups} must divide in_channels {in_channels} \
                 and out_channels {out_channels}"
            )));
        }
        let conv_config = nn::ConvConfig {
            stride: 1,
            padding: 1,
            groups,
            bias: false,
            ..Default::default()
        };
        let convolution = nn::conv2d(
            vs / "convolution",
            in_channels,
            out_channels,
            3,
            conv_config,
        );
        let normalization =
            nn::batch_norm2d(vs / "normalization", out_channels, Default::default());

        Ok(GroupedPixelEmbedding {
            convolution,
            normalization,
            out_channels,
        })
    }

    /// Embedding dimension of the produced tokens.
    #[must_use]
    pub fn out_channels(&self) -> i64 {
        self.out_channels
    }

    /// Forward pass; returns the token sequence and the spatial size.
    pub fn forward(&self, x: &Tensor, train: bool) -> (Tensor, i64) {
        let spatial_size = x.size()[2];
        let features = x
            .apply(&self.convolution)
            .apply_t(&self.normalization, train)
            .relu();
        // (B, C, S, S) -> (B, C, S*S) -> (B, S*S, C)
        let tokens = features.flatten(2, 3).transpose(1, 2);
        (tokens, spatial_size)
    }
}
