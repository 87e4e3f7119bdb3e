//! # HSI Fusion ML - Hyperspectral/LiDAR Fusion Classification Network
//!
//! A multi-branch neural network for hyperspectral/LiDAR fused image
//! classification, built on libtorch (`tch`). The architecture combines:
//!
//! - **Transformer pipeline**: staged grouped pixel embeddings feeding
//!   pre-norm transformer blocks over the spectral input
//! - **Morphological branches**: learned dilation/erosion convolution
//!   surrogates over the auxiliary (e.g. LiDAR elevation) input
//! - **3D spectral block**: multi-scale conv3d towers with a band-count
//!   kernel-depth policy
//! - **Fusion head**: pooled descriptors concatenated into a linear
//!   classifier producing per-class logits
//!
//! This crate defines the architecture only: parameter learning, gradient
//! computation, data loading and checkpointing belong to the surrounding
//! training harness.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hsi_fusion_ml::{FusionConfig, FusionNetwork};
//! use tch::{nn, Device, Tensor};
//!
//! # fn main() -> hsi_fusion_ml::Result<()> {
//! let vs = nn::VarStore::new(Device::Cpu);
//! let config = FusionConfig::default(); // 200 bands, 13x13, 10 classes
//! let network = FusionNetwork::new(&vs.root(), &config)?;
//!
//! let spectral = Tensor::randn([2, 1, 200, 13, 13], tch::kind::FLOAT_CPU);
//! let lidar = Tensor::randn([2, 1, 13, 13], tch::kind::FLOAT_CPU);
//! let logits = network.forward(&spectral, &lidar, false);
//! assert_eq!(logits.size(), vec![2, 10]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Use [`FusionConfigBuilder`] (or JSON via [`FusionConfig::from_json_file`])
//! for custom setups; `build()` validates every structural invariant before
//! any layer variable is registered:
//!
//! ```no_run
//! use hsi_fusion_ml::FusionConfig;
//!
//! # fn main() -> hsi_fusion_ml::Result<()> {
//! let config = FusionConfig::builder()
//!     .image_size(11)
//!     .num_bands(144)
//!     .num_classes(15)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod gate;
pub mod model;
pub mod morphology;
pub mod spectral;
pub mod transformer;

pub use config::{FusionConfig, FusionConfigBuilder};
pub use embedding::GroupedPixelEmbedding;
pub use error::{FusionError, Result};
pub use gate::SpatialAttentionGate;
pub use model::{FusionNetwork, FusionStage};
pub use morphology::{DilationConv, ErosionConv, MorphologicalBranch};
pub use spectral::{MultiScaleSpectralBlock, SpectralBandPolicy, SpectralConvLayer};
pub use transformer::{Activation, Mlp, MultiHeadSelfAttention, TransformerBlock};
