//! Configuration for the FAVOR+ attention module.
//!
//! [`AttentionConfig`] is the serialisable form: every recognised option with
//! the defaults used by Performer attention layers. It is resolved exactly
//! once into a [`ResolvedConfig`], which carries derived quantities (head
//! width, random feature count, the concrete fallback policy) and is shared by
//! reference with every component. Resolution fails fast; there is no partially
//! constructed module.

use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{AttentionError, AttentionResult};
use crate::fallback::ShortSequenceBehavior;
use crate::features::{num_random_features, KernelType};

/// Recognised configuration surface for [`PerformerAttention`](crate::PerformerAttention).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttentionConfig {
    /// Number of attention heads. Required.
    pub num_heads: Option<usize>,
    /// Model width; must be divisible by `num_heads`. Required.
    pub d_model: Option<usize>,
    /// Kernel turning projected queries/keys into positive features.
    pub kernel_type: KernelType,
    /// Restrict every position to itself and earlier positions.
    pub causal: bool,
    /// Draw the projection from stacked orthogonal blocks.
    pub use_orthogonal_features: bool,
    /// Scale orthogonal rows by `sqrt(d_head)` instead of Gaussian norms.
    pub regularize_feature_norms: bool,
    /// Forward passes between redraws; `None` keeps the first matrix forever.
    pub feature_redraw_interval: Option<usize>,
    /// Redraw on a `1 / interval` coin flip instead of a fixed schedule.
    pub redraw_stochastically: bool,
    /// Log at info level whenever features are redrawn during training.
    pub redraw_verbose: bool,
    /// Divide by the implied attention mass so outputs are convex combinations.
    pub normalize_output: bool,
    /// Normaliser entries with magnitude at or below this value are pushed away from zero.
    pub normalization_stabilizer: f64,
    /// Added to every prime feature to keep it strictly positive.
    pub kernel_epsilon: f64,
    /// When to fall back to exact softmax; `None` picks a kernel-appropriate default.
    pub short_sequence_behavior: Option<ShortSequenceBehavior>,
    /// Dropout applied to softmax weights on the fallback path while training.
    pub attention_dropout: f32,
    /// Project raw query/key/value inputs through learned linear layers.
    pub use_qkv_linear_layers: bool,
    /// Override for the number of random features `M`.
    pub num_random_features: Option<usize>,
    /// Seed for feature draws and stochastic redraws.
    pub seed: Option<u64>,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: None,
            d_model: None,
            kernel_type: KernelType::Exp,
            causal: false,
            use_orthogonal_features: true,
            regularize_feature_norms: true,
            feature_redraw_interval: Some(100),
            redraw_stochastically: false,
            redraw_verbose: false,
            normalize_output: true,
            normalization_stabilizer: 1e-6,
            kernel_epsilon: 1e-4,
            short_sequence_behavior: None,
            attention_dropout: 0.1,
            use_qkv_linear_layers: true,
            num_random_features: None,
            seed: None,
        }
    }
}

impl AttentionConfig {
    /// Default configuration for the given model width and head count.
    pub fn new(d_model: usize, num_heads: usize) -> Self {
        Self {
            d_model: Some(d_model),
            num_heads: Some(num_heads),
            ..Self::default()
        }
    }

    /// Parses and resolves a TOML document.
    pub fn from_toml_str(contents: &str) -> AttentionResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| AttentionError::ConfigFormat(e.to_string()))?;
        config.resolve()?;
        Ok(config)
    }

    /// Parses and resolves a JSON document.
    pub fn from_json_str(contents: &str) -> AttentionResult<Self> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| AttentionError::ConfigFormat(e.to_string()))?;
        config.resolve()?;
        Ok(config)
    }

    /// Loads a configuration file, choosing the format from its extension.
    pub fn from_path(path: impl AsRef<Path>) -> AttentionResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            Some("toml") | None => Self::from_toml_str(&contents),
            Some(other) => Err(AttentionError::ConfigFormat(format!(
                "unsupported configuration extension '{other}'"
            ))),
        }
    }

    /// Checks the configuration without keeping the derived values.
    pub fn validate(&self) -> AttentionResult<()> {
        self.resolve().map(|_| ())
    }

    /// Validates every option and derives the values components need.
    pub fn resolve(&self) -> AttentionResult<ResolvedConfig> {
        let (num_heads, d_model) = match (self.num_heads, self.d_model) {
            (Some(heads), Some(width)) => (heads, width),
            _ => {
                return Err(AttentionError::config(
                    "num_heads and d_model must both be set",
                ))
            }
        };

        let mut errors = Vec::new();
        if num_heads == 0 {
            errors.push("num_heads must be greater than zero".to_string());
        }
        if d_model == 0 {
            errors.push("d_model must be greater than zero".to_string());
        }
        if num_heads > 0 && d_model % num_heads != 0 {
            errors.push(format!(
                "d_model ({d_model}) must be divisible by num_heads ({num_heads})"
            ));
        }
        if !(self.normalization_stabilizer > 0.0) {
            errors.push("normalization_stabilizer must be positive".to_string());
        }
        if !(self.kernel_epsilon > 0.0) {
            errors.push("kernel_epsilon must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.attention_dropout) {
            errors.push("attention_dropout must be in [0, 1)".to_string());
        }
        if self.feature_redraw_interval == Some(0) {
            errors.push("feature_redraw_interval must be greater than zero".to_string());
        }
        if self.num_random_features == Some(0) {
            errors.push("num_random_features must be greater than zero".to_string());
        }

        let fallback = match &self.short_sequence_behavior {
            None if self.kernel_type == KernelType::Relu => ShortSequenceBehavior::NeverUseSoftmax,
            None => ShortSequenceBehavior::UseSoftmaxEvalOnly,
            Some(behavior) => {
                if self.kernel_type == KernelType::Relu
                    && !matches!(behavior, ShortSequenceBehavior::NeverUseSoftmax)
                {
                    errors.push(format!(
                        "short_sequence_behavior = {} cannot be combined with the relu kernel",
                        behavior.name()
                    ));
                }
                behavior.clone()
            }
        };

        if !errors.is_empty() {
            return Err(AttentionError::config(errors.join("; ")));
        }

        let head_dim = d_model / num_heads;
        let num_features = self
            .num_random_features
            .unwrap_or_else(|| num_random_features(head_dim));
        if num_features == 0 {
            return Err(AttentionError::config(format!(
                "head dimension {head_dim} yields no random features; set num_random_features"
            )));
        }

        Ok(ResolvedConfig {
            num_heads,
            d_model,
            head_dim,
            num_features,
            kernel: self.kernel_type,
            causal: self.causal,
            use_orthogonal_features: self.use_orthogonal_features,
            regularize_feature_norms: self.regularize_feature_norms,
            feature_redraw_interval: self.feature_redraw_interval.and_then(NonZeroUsize::new),
            redraw_stochastically: self.redraw_stochastically,
            redraw_verbose: self.redraw_verbose,
            normalize_output: self.normalize_output,
            normalization_stabilizer: self.normalization_stabilizer,
            kernel_epsilon: self.kernel_epsilon,
            fallback,
            attention_dropout: self.attention_dropout,
            use_qkv_linear_layers: self.use_qkv_linear_layers,
            seed: self.seed,
        })
    }
}

/// Validated configuration with derived quantities filled in.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub num_heads: usize,
    pub d_model: usize,
    pub head_dim: usize,
    /// Rows of the random feature matrix (`M`).
    pub num_features: usize,
    pub kernel: KernelType,
    pub causal: bool,
    pub use_orthogonal_features: bool,
    pub regularize_feature_norms: bool,
    pub feature_redraw_interval: Option<NonZeroUsize>,
    pub redraw_stochastically: bool,
    pub redraw_verbose: bool,
    pub normalize_output: bool,
    pub normalization_stabilizer: f64,
    pub kernel_epsilon: f64,
    pub fallback: ShortSequenceBehavior,
    pub attention_dropout: f32,
    pub use_qkv_linear_layers: bool,
    pub seed: Option<u64>,
}
