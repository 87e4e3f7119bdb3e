//! Learned morphological branches over the auxiliary (e.g. LiDAR) input.
//!
//! Max-pooling after a convolution acts as a grayscale dilation surrogate on
//! the learned features; sandwiching the pooling between two negations
//! realizes erosion as the dual operation, `erosion(x) = -dilation(-x)`.

use tch::{nn, Tensor};

use crate::error::{FusionError, Result};

/// Kernel sizes of the three branch variants.
pub const BRANCH_KERNEL_SIZES: [i64; 3] = [1, 3, 5];

fn branch_conv(vs: &nn::Path, in_channels: i64, out_channels: i64, kernel_size: i64) -> nn::Conv2D {
    let conv_config = nn::ConvConfig {
        stride: 1,
        padding: kernel_size / 2,
        // Bias would break the exact erosion/dilation duality: the two
        // operators are negation duals only for a linear convolution.
        bias: false,
        ..Default::default()
    };
    nn::conv2d(vs / "convolution", in_channels, out_channels, kernel_size, conv_config)
}

fn check_kernel(kernel_size: i64) -> Result<()> {
    if kernel_size <= 0 || kernel_size % 2 == 0 {
        return Err(FusionError::config(format!(
            "morphological kernel size must be odd and positive, got {kernel_size}"
        )));
    }
    Ok(())
}

/// Dilation-style branch: convolution then size-preserving max-pooling.
///
/// Input:  (batch, in_channels, h, w)
/// Output: (batch, out_channels, h, w)
#[derive(Debug)]
pub struct DilationConv {
    convolution: nn::Conv2D,
}

impl DilationConv {
    /// # Errors
    ///
    /// Returns a configuration error for an even or non-positive kernel size
    /// (matched padding requires an odd kernel).
    pub fn new(vs: &nn::Path, in_channels: i64, out_channels: i64, kernel_size: i64) -> Result<Self> {
        check_kernel(kernel_size)?;
        Ok(DilationConv {
            convolution: branch_conv(vs, in_channels, out_channels, kernel_size),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        x.apply(&self.convolution)
            .max_pool2d([3, 3], [1, 1], [1, 1], [1, 1], false)
    }
}

/// Erosion-style branch: convolution, negate, max-pool, negate again.
///
/// Input:  (batch, in_channels, h, w)
/// Output: (batch, out_channels, h, w)
///
/// Both negations are mandatory; dropping either one silently degenerates
/// erosion into dilation.
#[derive(Debug)]
pub struct ErosionConv {
    convolution: nn::Conv2D,
}

impl ErosionConv {
    /// # Errors
    ///
    /// Returns a configuration error for an even or non-positive kernel size.
    pub fn new(vs: &nn::Path, in_channels: i64, out_channels: i64, kernel_size: i64) -> Result<Self> {
        check_kernel(kernel_size)?;
        Ok(ErosionConv {
            convolution: branch_conv(vs, in_channels, out_channels, kernel_size),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        x.apply(&self.convolution)
            .neg()
            .max_pool2d([3, 3], [1, 1], [1, 1], [1, 1], false)
            .neg()
    }
}

/// Full morphological pipeline over the auxiliary input.
///
/// Input:  (batch, in_channels, h, w)
/// Output: (batch, fused_channels, pool_size, pool_size)
///
/// Six branches (1x1 / 3x3 / 5x5, dilation and erosion), each remapped
/// through the same pair of 1x1 convolutions to the fused width,
/// elementwise-summed, BatchNorm2d, ReLU, adaptive average pooling.
#[derive(Debug)]
pub struct MorphologicalBranch {
    dilations: Vec<DilationConv>,
    erosions: Vec<ErosionConv>,
    remap1: nn::Conv2D,
    remap2: nn::Conv2D,
    normalization: nn::BatchNorm,
    pool_size: i64,
}

impl MorphologicalBranch {
    /// # Errors
    ///
    /// Returns a configuration error for non-positive widths or pool size.
    pub fn new(
        vs: &nn::Path,
        in_channels: i64,
        branch_channels: i64,
        fused_channels: i64,
        pool_size: i64,
    ) -> Result<Self> {
        if in_channels <= 0 || branch_channels <= 0 || fused_channels <= 0 {
            return Err(FusionError::config(
                "morphological channel widths must be positive",
            ));
        }
        if pool_size <= 0 {
            return Err(FusionError::config("morphological pool size must be positive"));
        }

        let mut dilations = Vec::with_capacity(BRANCH_KERNEL_SIZES.len());
        let mut erosions = Vec::with_capacity(BRANCH_KERNEL_SIZES.len());
        for kernel_size in BRANCH_KERNEL_SIZES {
            dilations.push(DilationConv::new(
                &(vs / "dilation" / kernel_size),
                in_channels,
                branch_channels,
                kernel_size,
            )?);
            erosions.push(ErosionConv::new(
                &(vs / "erosion" / kernel_size),
                in_channels,
                branch_channels,
                kernel_size,
            )?);
        }

        let remap_config = nn::ConvConfig {
            bias: false,
            ..Default::default()
        };
        let remap1 = nn::conv2d(vs / "remap1", branch_channels, fused_channels, 1, remap_config);
        let remap2 = nn::conv2d(vs / "remap2", fused_channels, fused_channels, 1, remap_config);
        let normalization =
            nn::batch_norm2d(vs / "normalization", fused_channels, Default::default());

        Ok(MorphologicalBranch {
            dilations,
            erosions,
            remap1,
            remap2,
            normalization,
            pool_size,
        })
    }

    fn remap(&self, branch_output: &Tensor) -> Tensor {
        branch_output.apply(&self.remap1).apply(&self.remap2)
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let mut fused = self.remap(&self.dilations[0].forward(x));
        for dilation in &self.dilations[1..] {
            fused = fused + self.remap(&dilation.forward(x));
        }
        for erosion in &self.erosions {
            fused = fused + self.remap(&erosion.forward(x));
        }

        fused
            .apply_t(&self.normalization, train)
            .relu()
            .adaptive_avg_pool2d([self.pool_size, self.pool_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tch::Device;

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(5)]
    fn test_branches_preserve_spatial_extent(#[case] kernel_size: i64) {
        let vs = nn::VarStore::new(Device::Cpu);
        let dilation =
            DilationConv::new(&(vs.root() / "d"), 1, 16, kernel_size).expect("valid kernel");
        let erosion =
            ErosionConv::new(&(vs.root() / "e"), 1, 16, kernel_size).expect("valid kernel");

        let input = Tensor::randn([2, 1, 13, 13], tch::kind::FLOAT_CPU);
        assert_eq!(dilation.forward(&input).size(), vec![2, 16, 13, 13]);
        assert_eq!(erosion.forward(&input).size(), vec![2, 16, 13, 13]);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(5)]
    fn test_erosion_is_dual_of_dilation(#[case] kernel_size: i64) {
        // Identical variable names in separate stores, then copy weights
        // across so both branches share the same convolution.
        let vs_dilation = nn::VarStore::new(Device::Cpu);
        let mut vs_erosion = nn::VarStore::new(Device::Cpu);
        let dilation =
            DilationConv::new(&vs_dilation.root(), 1, 16, kernel_size).expect("valid kernel");
        let erosion =
            ErosionConv::new(&vs_erosion.root(), 1, 16, kernel_size).expect("valid kernel");
        vs_erosion.copy(&vs_dilation).expect("matching variables");

        let input = Tensor::randn([2, 1, 13, 13], tch::kind::FLOAT_CPU);
        let eroded = erosion.forward(&input);
        let dual = dilation.forward(&input.neg()).neg();
        assert!(eroded.allclose(&dual, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_even_kernel_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(DilationConv::new(&vs.root(), 1, 16, 2).is_err());
        assert!(ErosionConv::new(&vs.root(), 1, 16, 0).is_err());
    }

    #[test]
    fn test_pipeline_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let branch = MorphologicalBranch::new(&vs.root(), 1, 16, 64, 1).expect("valid widths");

        let input = Tensor::randn([2, 1, 13, 13], tch::kind::FLOAT_CPU);
        let output = branch.forward(&input, false);
        assert_eq!(output.size(), vec![2, 64, 1, 1]);
    }

    #[test]
    fn test_pipeline_rejects_bad_widths() {
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(MorphologicalBranch::new(&vs.root(), 1, 0, 64, 1).is_err());
        assert!(MorphologicalBranch::new(&vs.root(), 1, 16, 64, 0).is_err());
    }
}
