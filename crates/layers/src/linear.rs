//! Linear and affine projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` or `(rows,
//! in_dim)` and return tensors with the same leading dimensions and `out_dim`
//! trailing features. Weights follow the `(out_dim, in_dim)` convention so a
//! forward pass computes `x @ W^T + b`. Parameters live in [`Var`]s, which
//! keeps them trainable through Candle's autodiff.
//!
//! Pruning produces a fresh layer holding a subset of the rows (output
//! features) or columns (input features) of the original weight; see
//! [`Linear::prune`].

use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};

use crate::checks;

const SUPPORTED_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the projection to `hidden`.
    fn forward(&self, hidden: &Tensor) -> Result<Tensor>;
}

/// Weight initialisation policies for projection layers.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Kaiming/He uniform with the given leaky-relu slope. A slope of
    /// `sqrt(5)` gives the `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` range used by
    /// `nn.Linear`-style layers.
    KaimingUniform { negative_slope: f64 },
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let fan_in = shape.1 as f64;
        let weight = match self {
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3.0f64.sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
        };
        weight.to_dtype(dtype)
    }
}

/// Which axis of the weight matrix [`Linear::prune`] keeps entries along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneDim {
    /// Keep a subset of output features (weight rows and bias entries).
    Output,
    /// Keep a subset of input features (weight columns); the bias is untouched.
    Input,
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, &weight, bias.as_ref())?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: bias.map(|b| Var::from_tensor(&b)).transpose()?,
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns a clone of the underlying weight tensor.
    pub fn weight(&self) -> Tensor {
        self.weight.as_tensor().clone()
    }

    /// Returns a clone of the bias tensor if present.
    pub fn bias(&self) -> Option<Tensor> {
        self.bias.as_ref().map(|bias| bias.as_tensor().clone())
    }

    /// Trainable parameters, weight first.
    pub fn vars(&self) -> Vec<Var> {
        let mut vars = vec![self.weight.clone()];
        vars.extend(self.bias.iter().cloned());
        vars
    }

    /// Builds a new layer keeping only the entries at `index` along `dim`.
    ///
    /// Pruning along [`PruneDim::Output`] drops weight rows and the matching
    /// bias entries; [`PruneDim::Input`] drops weight columns and keeps the
    /// bias as-is. The returned layer owns fresh parameters.
    pub fn prune(&self, index: &[u32], dim: PruneDim) -> Result<Self> {
        let bound = match dim {
            PruneDim::Output => self.config.output_dim,
            PruneDim::Input => self.config.input_dim,
        };
        if let Some(bad) = index.iter().find(|&&i| i as usize >= bound) {
            bail!("prune index {bad} out of range for dimension of size {bound}");
        }

        let device = self.weight.device();
        let ids = Tensor::from_vec(index.to_vec(), index.len(), device)?;
        let weight = self.weight.as_tensor();
        let (config, weight, bias) = match dim {
            PruneDim::Output => {
                let weight = weight.index_select(&ids, 0)?;
                let bias = self
                    .bias
                    .as_ref()
                    .map(|b| b.as_tensor().index_select(&ids, 0))
                    .transpose()?;
                let config = LinearConfig {
                    output_dim: index.len(),
                    ..self.config.clone()
                };
                (config, weight, bias)
            }
            PruneDim::Input => {
                let weight = weight.index_select(&ids, 1)?;
                let bias = self.bias();
                let config = LinearConfig {
                    input_dim: index.len(),
                    ..self.config.clone()
                };
                (config, weight, bias)
            }
        };
        Self::new(config, weight.detach().contiguous()?, bias.map(|b| b.detach()))
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, SUPPORTED_DTYPES)
    }

    fn validate_bias(config: &LinearConfig, weight: &Tensor, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_rank("linear.bias", tensor, 1)?;
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_same_dtype("linear.bias", tensor, weight)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [batch, seq, _] => {
                checks::expect_batch_seq_hidden("linear.input", hidden, self.config.input_dim)?;
                if *batch == 0 || *seq == 0 {
                    bail!("linear.input: batch/seq dimensions must be non-zero");
                }
                Ok(())
            }
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => Ok(()),
            [_, hidden_dim] => bail!(
                "linear.input: expected last dim {} but received {}",
                self.config.input_dim,
                hidden_dim
            ),
            dims => bail!("linear expects input shaped [B, T, H_in] or [T, H_in], got {dims:?}"),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        self.validate_input(hidden)?;
        checks::expect_same_dtype("linear.input", hidden, self.weight.as_tensor())?;

        let weight_t = self.weight.as_tensor().t()?;
        let mut output = match hidden.dims() {
            [batch, seq, _] => {
                let flat = hidden.reshape((*batch * *seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((*batch, *seq, self.config.output_dim))?
            }
            _ => hidden.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias.as_tensor())?;
        }
        Ok(output)
    }
}
