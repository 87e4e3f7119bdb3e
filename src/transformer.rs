//! Transformer building blocks: activation, MLP, multi-head self-attention
//! and the pre-norm residual block.

use serde::{Deserialize, Serialize};
use tch::{nn, Kind, Tensor};

use crate::error::{FusionError, Result};

/// Activation functions for the MLP blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    ReLU,
    GELU,
    SiLU,
}

impl Activation {
    pub fn apply(&self, tensor: &Tensor) -> Tensor {
        match self {
            Activation::ReLU => tensor.relu(),
            Activation::GELU => tensor.gelu("none"),
            Activation::SiLU => tensor.silu(),
        }
    }
}

impl std::fmt::Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Activation::ReLU => write!(f, "relu"),
            Activation::GELU => write!(f, "gelu"),
            Activation::SiLU => write!(f, "silu"),
        }
    }
}

impl std::str::FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relu" => Ok(Activation::ReLU),
            "gelu" => Ok(Activation::GELU),
            "silu" | "swish" => Ok(Activation::SiLU),
            _ => Err(format!("unknown activation function: '{s}'")),
        }
    }
}

/// Two-layer pointwise feed-forward block.
///
/// Input:  (batch, tokens, in_dim)
/// Output: (batch, tokens, in_dim)
///
/// fc1 -> activation -> dropout -> fc2 -> dropout. Dropout is identity when
/// `train` is false.
#[derive(Debug)]
pub struct Mlp {
    fc1: nn::Linear,
    fc2: nn::Linear,
    activation: Activation,
    dropout: f64,
}

impl Mlp {
    pub fn new(
        vs: &nn::Path,
        in_dim: i64,
        hidden_dim: i64,
        activation: Activation,
        dropout: f64,
    ) -> Self {
        let fc1 = nn::linear(vs / "fc1", in_dim, hidden_dim, Default::default());
        let fc2 = nn::linear(vs / "fc2", hidden_dim, in_dim, Default::default());
        Mlp {
            fc1,
            fc2,
            activation,
            dropout,
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let hidden = self.activation.apply(&x.apply(&self.fc1));
        let hidden = hidden.dropout(self.dropout, train);
        hidden.apply(&self.fc2).dropout(self.dropout, train)
    }
}

/// Multi-head self-attention with a fused key/value projection.
///
/// Input:  (batch, tokens, embed_dim)
/// Output: (batch, tokens, embed_dim)
///
/// Queries come from a dedicated projection; keys and values share one fused
/// projection (embed_dim -> 2 * embed_dim) split per head. Softmax is taken
/// over the key axis.
#[derive(Debug)]
pub struct MultiHeadSelfAttention {
    embed_dim: i64,
    num_heads: i64,
    head_dim: i64,
    scaling: f64,
    attn_dropout: f64,
    proj_dropout: f64,

    q_proj: nn::Linear,
    kv_proj: nn::Linear,
    out_proj: nn::Linear,
}

impl MultiHeadSelfAttention {
    /// # Errors
    ///
    /// Returns a configuration error if `num_heads` does not divide
    /// `embed_dim`.
    pub fn new(
        vs: &nn::Path,
        embed_dim: i64,
        num_heads: i64,
        attn_dropout: f64,
        proj_dropout: f64,
    ) -> Result<Self> {
        if num_heads <= 0 || embed_dim % num_heads != 0 {
            return Err(FusionError::config(format!(
                "embed_dim {embed_dim} not divisible by {num_heads} heads"
            )));
        }
        let head_dim = embed_dim / num_heads;
        let scaling = (head_dim as f64).powf(-0.5);

        let q_proj = nn::linear(vs / "q_proj", embed_dim, embed_dim, Default::default());
        let kv_proj = nn::linear(vs / "kv_proj", embed_dim, 2 * embed_dim, Default::default());
        let out_proj = nn::linear(vs / "out_proj", embed_dim, embed_dim, Default::default());

        Ok(MultiHeadSelfAttention {
            embed_dim,
            num_heads,
            head_dim,
            scaling,
            attn_dropout,
            proj_dropout,
            q_proj,
            kv_proj,
            out_proj,
        })
    }

    /// Forward pass.
    ///
    /// Returns the attended output and, when `output_attentions` is set, the
    /// post-softmax attention weights shaped
    /// (batch, heads, tokens, tokens) whose rows sum to 1.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        output_attentions: bool,
        train: bool,
    ) -> (Tensor, Option<Tensor>) {
        let shape = hidden_states.size();
        let (batch, tokens) = (shape[0], shape[1]);

        // (B, N, C) -> (B, H, N, head_dim)
        let queries = hidden_states
            .apply(&self.q_proj)
            .view([batch, tokens, self.num_heads, self.head_dim])
            .transpose(1, 2);

        // Fused KV: (B, N, 2C) -> (2, B, H, N, head_dim)
        let kv = hidden_states
            .apply(&self.kv_proj)
            .view([batch, tokens, 2, self.num_heads, self.head_dim])
            .permute([2, 0, 3, 1, 4]);
        let keys = kv.get(0);
        let values = kv.get(1);

        // Scores over the key axis: (B, H, N, N)
        let scores = queries.matmul(&keys.transpose(-2, -1)) * self.scaling;
        let attn_weights = scores.softmax(-1, Kind::Float);

        let attn_weights_out = if output_attentions {
            Some(attn_weights.shallow_clone())
        } else {
            None
        };

        let attn_probs = attn_weights.dropout(self.attn_dropout, train);

        // (B, H, N, head_dim) -> (B, N, C)
        let context = attn_probs
            .matmul(&values)
            .transpose(1, 2)
            .reshape([batch, tokens, self.embed_dim]);

        let output = context
            .apply(&self.out_proj)
            .dropout(self.proj_dropout, train);

        (output, attn_weights_out)
    }
}

/// Pre-norm residual transformer block.
///
/// Input/output: (batch, tokens, embed_dim), shape unchanged.
///
/// Computes `x = x + Attn(LayerNorm(x))` then `x = x + Mlp(LayerNorm(x))`.
/// Normalizing before each sub-layer and adding the residual after is
/// load-bearing for training stability; the order must not change.
#[derive(Debug)]
pub struct TransformerBlock {
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    attention: MultiHeadSelfAttention,
    mlp: Mlp,
}

impl TransformerBlock {
    /// # Errors
    ///
    /// Returns a configuration error if `num_heads` does not divide
    /// `embed_dim`.
    pub fn new(
        vs: &nn::Path,
        embed_dim: i64,
        num_heads: i64,
        mlp_ratio: f64,
        activation: Activation,
        dropout: f64,
        attn_dropout: f64,
    ) -> Result<Self> {
        let norm1 = nn::layer_norm(vs / "norm1", vec![embed_dim], Default::default());
        let norm2 = nn::layer_norm(vs / "norm2", vec![embed_dim], Default::default());
        let attention =
            MultiHeadSelfAttention::new(&(vs / "attn"), embed_dim, num_heads, attn_dropout, dropout)?;
        let hidden_dim = ((embed_dim as f64 * mlp_ratio) as i64).max(1);
        let mlp = Mlp::new(&(vs / "mlp"), embed_dim, hidden_dim, activation, dropout);

        Ok(TransformerBlock {
            norm1,
            norm2,
            attention,
            mlp,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        let (attn_out, _) = self
            .attention
            .forward(&x.apply(&self.norm1), false, train);
        let x = x + attn_out;
        let mlp_out = self.mlp.forward(&x.apply(&self.norm2), train);
        x + mlp_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn test_mlp_preserves_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mlp = Mlp::new(&vs.root(), 64, 128, Activation::GELU, 0.1);

        let input = Tensor::randn([2, 9, 64], tch::kind::FLOAT_CPU);
        let output = mlp.forward(&input, false);
        assert_eq!(output.size(), vec![2, 9, 64]);
    }

    #[test]
    fn test_attention_preserves_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let attention =
            MultiHeadSelfAttention::new(&vs.root(), 64, 8, 0.0, 0.0).expect("valid heads");

        let input = Tensor::randn([2, 25, 64], tch::kind::FLOAT_CPU);
        let (output, weights) = attention.forward(&input, false, false);
        assert_eq!(output.size(), vec![2, 25, 64]);
        assert!(weights.is_none());
    }

    #[test]
    fn test_attention_weights_sum_to_one_over_keys() {
        let vs = nn::VarStore::new(Device::Cpu);
        let attention =
            MultiHeadSelfAttention::new(&vs.root(), 32, 4, 0.0, 0.0).expect("valid heads");

        let input = Tensor::randn([3, 10, 32], tch::kind::FLOAT_CPU);
        let (_, weights) = attention.forward(&input, true, false);
        let weights = weights.expect("requested attention weights");
        assert_eq!(weights.size(), vec![3, 4, 10, 10]);

        let row_sums = weights.sum_dim_intlist(&[-1i64][..], false, Kind::Float);
        let ones = Tensor::ones([3, 4, 10], tch::kind::FLOAT_CPU);
        assert!(row_sums.allclose(&ones, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_attention_rejects_indivisible_heads() {
        let vs = nn::VarStore::new(Device::Cpu);
        let err = MultiHeadSelfAttention::new(&vs.root(), 64, 7, 0.0, 0.0).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_block_preserves_shape_and_adds_residual() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = TransformerBlock::new(&vs.root(), 64, 8, 1.0, Activation::GELU, 0.0, 0.0)
            .expect("valid block");

        let input = Tensor::randn([2, 16, 64], tch::kind::FLOAT_CPU);
        let output = block.forward(&input, false);
        assert_eq!(output.size(), vec![2, 16, 64]);

        // The residual path keeps the input contribution alive: the output
        // cannot be identically zero for a random input.
        let zeros = Tensor::zeros([2, 16, 64], tch::kind::FLOAT_CPU);
        assert!(!output.allclose(&zeros, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_activation_from_str_roundtrip() {
        use std::str::FromStr;

        for act in [Activation::ReLU, Activation::GELU, Activation::SiLU] {
            let s = act.to_string();
            assert_eq!(Activation::from_str(&s).unwrap(), act);
        }
        assert_eq!(Activation::from_str("swish").unwrap(), Activation::SiLU);
        assert!(Activation::from_str("tanh").is_err());
    }

    #[test]
    fn test_activation_shapes() {
        let tensor = Tensor::randn([2, 3, 4], tch::kind::FLOAT_CPU);
        for act in [Activation::ReLU, Activation::GELU, Activation::SiLU] {
            assert_eq!(act.apply(&tensor).size(), vec![2, 3, 4]);
        }
    }
}
