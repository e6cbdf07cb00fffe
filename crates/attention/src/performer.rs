//! The Performer attention module.
//!
//! [`PerformerAttention`] owns everything that outlives a single call: the
//! optional Q/K/V projections, the output projection, the random feature
//! matrix with its redraw schedule, the RNG and the training flag. Each
//! forward call splits inputs into heads, asks the fallback policy whether
//! exact softmax is cheaper, and otherwise runs the FAVOR+ pipeline
//! (redraw check, kernel feature map, linear aggregation) before merging
//! heads and applying the output projection.

use std::collections::BTreeSet;
use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use layers::{
    find_pruneable_heads_and_indices, prune_linear_layer, Linear, LinearConfig, LinearInit,
    LinearLayer, PruneDim,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::core::{
    AttentionConfig, AttentionError, AttentionResult, LinearAggregation, ResolvedConfig,
};
use crate::features::{
    FeatureMatrix, FeatureRedrawScheduler, FeatureStore, KernelFeatureMap, RandomFeatureGenerator,
    RedrawDecision,
};
use crate::linear::aggregation_for;
use crate::masks::{key_mask_multiplier, validate_key_mask};
use crate::reference::ExactAttention;

/// Result of a forward call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch, q_len, d_model]` after the output projection.
    pub context: Tensor,
    /// `[batch, heads, q_len, k_len]`; only produced by the softmax fallback
    /// when weights were requested.
    pub attention_weights: Option<Tensor>,
}

/// FAVOR+ multi-head attention with an exact softmax fallback.
pub struct PerformerAttention {
    config: ResolvedConfig,
    input_width: usize,
    dtype: DType,
    device: Device,
    q_lin: Option<Linear>,
    k_lin: Option<Linear>,
    v_lin: Option<Linear>,
    out_lin: Linear,
    generator: RandomFeatureGenerator,
    feature_map: KernelFeatureMap,
    aggregation: Box<dyn LinearAggregation>,
    exact: ExactAttention,
    scheduler: FeatureRedrawScheduler,
    features: FeatureStore,
    rng: StdRng,
    pruned_heads: BTreeSet<usize>,
    training: bool,
    initialised: bool,
}

impl fmt::Debug for PerformerAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformerAttention")
            .field("num_heads", &self.config.num_heads)
            .field("d_model", &self.config.d_model)
            .field("num_features", &self.config.num_features)
            .field("kernel", &self.config.kernel)
            .field("causal", &self.config.causal)
            .field("training", &self.training)
            .field("pruned_heads", &self.pruned_heads)
            .finish()
    }
}

impl PerformerAttention {
    /// Validates `config` and builds the module with freshly initialised
    /// projections. The feature matrix is drawn lazily on first use.
    pub fn new(config: &AttentionConfig, device: &Device, dtype: DType) -> AttentionResult<Self> {
        if !matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        let resolved = config.resolve()?;
        let width = resolved.d_model;

        // Matches the default initialisation of `nn.Linear`-style layers.
        let init = LinearInit::KaimingUniform {
            negative_slope: 5f64.sqrt(),
        };
        let projection = |device: &Device| {
            Linear::with_init(LinearConfig::new(width, width), &init, device, dtype)
        };
        let (q_lin, k_lin, v_lin) = if resolved.use_qkv_linear_layers {
            (
                Some(projection(device)?),
                Some(projection(device)?),
                Some(projection(device)?),
            )
        } else {
            (None, None, None)
        };
        let out_lin = projection(device)?;

        let rng = match resolved.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            input_width: width,
            dtype,
            device: device.clone(),
            q_lin,
            k_lin,
            v_lin,
            out_lin,
            generator: RandomFeatureGenerator::from_config(&resolved),
            feature_map: KernelFeatureMap::from_config(&resolved),
            aggregation: aggregation_for(&resolved),
            exact: ExactAttention::from_config(&resolved),
            scheduler: FeatureRedrawScheduler::new(
                resolved.feature_redraw_interval,
                resolved.redraw_stochastically,
            ),
            features: FeatureStore::new(),
            rng,
            pruned_heads: BTreeSet::new(),
            training: true,
            initialised: false,
            config: resolved,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    /// Width of the merged heads; shrinks when heads are pruned.
    pub fn d_model(&self) -> usize {
        self.config.d_model
    }

    pub fn pruned_heads(&self) -> &BTreeSet<usize> {
        &self.pruned_heads
    }

    /// Modules start in training mode.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Current random feature matrix, if one has been drawn.
    pub fn feature_matrix(&self) -> Option<&FeatureMatrix> {
        self.features.current()
    }

    pub fn calls_since_last_redraw(&self) -> usize {
        self.scheduler.calls_since_last_redraw()
    }

    /// Trainable parameters of every owned projection.
    pub fn vars(&self) -> Vec<Var> {
        [&self.q_lin, &self.k_lin, &self.v_lin]
            .into_iter()
            .flatten()
            .chain(std::iter::once(&self.out_lin))
            .flat_map(Linear::vars)
            .collect()
    }

    /// Draws a new feature matrix immediately and restarts the redraw count.
    pub fn redraw_features_now(&mut self) -> AttentionResult<()> {
        self.redraw()?;
        self.scheduler.mark_redrawn();
        Ok(())
    }

    /// Removes the given heads (original numbering) from every projection.
    ///
    /// Already pruned heads are ignored; an empty request is a no-op.
    pub fn prune_heads(&mut self, heads: &[usize]) -> AttentionResult<()> {
        if heads.is_empty() {
            return Ok(());
        }
        let (Some(q_lin), Some(k_lin), Some(v_lin)) = (&self.q_lin, &self.k_lin, &self.v_lin)
        else {
            return Err(AttentionError::config(
                "prune_heads requires use_qkv_linear_layers",
            ));
        };
        let original_heads = self.config.num_heads + self.pruned_heads.len();
        if let Some(bad) = heads.iter().find(|&&h| h >= original_heads) {
            return Err(AttentionError::config(format!(
                "cannot prune head {bad}: module has {original_heads} heads"
            )));
        }

        let head_dim = self.config.head_dim;
        let (heads, index) = find_pruneable_heads_and_indices(
            heads,
            self.config.num_heads,
            head_dim,
            &self.pruned_heads,
        );
        if heads.is_empty() {
            return Ok(());
        }
        if heads.len() >= self.config.num_heads {
            return Err(AttentionError::config("cannot prune every attention head"));
        }

        let q_lin = prune_linear_layer(q_lin, &index, PruneDim::Output)?;
        let k_lin = prune_linear_layer(k_lin, &index, PruneDim::Output)?;
        let v_lin = prune_linear_layer(v_lin, &index, PruneDim::Output)?;
        let out_lin = prune_linear_layer(&self.out_lin, &index, PruneDim::Input)?;
        self.q_lin = Some(q_lin);
        self.k_lin = Some(k_lin);
        self.v_lin = Some(v_lin);
        self.out_lin = out_lin;

        self.config.num_heads -= heads.len();
        self.config.d_model = head_dim * self.config.num_heads;
        self.feature_map.set_d_model(self.config.d_model);
        log::debug!(
            "attention::performer pruned heads {:?}; {} heads remain",
            heads,
            self.config.num_heads
        );
        self.pruned_heads.extend(heads);
        Ok(())
    }

    /// Multi-head attention over `[batch, seq, d_model]` inputs.
    ///
    /// * `mask`: optional `[batch, k_len]` key padding mask, nonzero = attend.
    /// * `head_mask`: optional `[heads]` or `[batch|1, heads, 1|q_len, 1]`
    ///   multiplier applied to per-head context.
    /// * `output_attentions`: request the weight matrix. Only the softmax
    ///   fallback can honour it; on the FAVOR+ path the call fails with
    ///   [`AttentionError::UnsupportedConfiguration`].
    pub fn forward(
        &mut self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> AttentionResult<AttentionOutput> {
        let (batch, q_len, k_len) = self.validate_inputs(query, key, value)?;
        if let Some(mask) = mask {
            validate_key_mask(mask, batch, k_len)?;
        }
        self.log_first_call();

        let q = self.split_heads(&project(self.q_lin.as_ref(), query)?)?;
        let k = self.split_heads(&project(self.k_lin.as_ref(), key)?)?;
        let v = self.split_heads(&project(self.v_lin.as_ref(), value)?)?;

        let use_softmax =
            self.config
                .fallback
                .should_fallback(q_len, self.config.num_features, self.training);
        if use_softmax {
            log::debug!(
                "attention::performer softmax fallback seq_len={q_len} num_features={} training={}",
                self.config.num_features,
                self.training
            );
            let (context, weights) = self.exact.attend(&q, &k, &v, mask, self.training)?;
            let context = self.finalize(&context, head_mask)?;
            return Ok(AttentionOutput {
                context,
                attention_weights: output_attentions.then_some(weights),
            });
        }

        if output_attentions {
            return Err(AttentionError::UnsupportedConfiguration(
                "attention weights are never materialised on the FAVOR+ path".to_string(),
            ));
        }

        self.redraw_if_needed()?;
        let features = match self.features.current() {
            Some(matrix) => matrix.tensor.clone(),
            None => {
                return Err(AttentionError::config(
                    "random feature matrix missing after redraw",
                ))
            }
        };
        let (q_prime, k_prime) = self.feature_map.project(&q, &k, &features)?;
        let key_mask = mask
            .map(|m| key_mask_multiplier(m, k_prime.dtype()))
            .transpose()?;
        let context = self
            .aggregation
            .aggregate(&q_prime, &k_prime, &v, key_mask.as_ref())?;
        let context = self.finalize(&context, head_mask)?;
        Ok(AttentionOutput {
            context,
            attention_weights: None,
        })
    }

    fn validate_inputs(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
    ) -> AttentionResult<(usize, usize, usize)> {
        let expect = |name: &str, tensor: &Tensor| -> AttentionResult<(usize, usize)> {
            match tensor.dims() {
                [b, s, w] if *w == self.input_width => Ok((*b, *s)),
                dims => Err(AttentionError::shape(format!(
                    "{name} must be [batch, seq, {}], got {dims:?}",
                    self.input_width
                ))),
            }
        };
        let (batch, q_len) = expect("query", query)?;
        let (kb, k_len) = expect("key", key)?;
        let (vb, v_len) = expect("value", value)?;
        if kb != batch || vb != batch || v_len != k_len {
            return Err(AttentionError::shape(format!(
                "query/key/value disagree: {:?} {:?} {:?}",
                query.dims(),
                key.dims(),
                value.dims()
            )));
        }
        if q_len == 0 || k_len == 0 {
            return Err(AttentionError::EmptySequence {
                context: "performer attention input",
            });
        }
        Ok((batch, q_len, k_len))
    }

    fn log_first_call(&mut self) {
        if self.initialised {
            return;
        }
        self.initialised = true;
        log::info!(
            "attention::performer init heads={} d_model={} head_dim={} features={} kernel={} causal={} orthogonal={} smreg={} redraw_interval={:?} stochastic={} fallback={:?} dtype={:?} device={:?}",
            self.config.num_heads,
            self.config.d_model,
            self.config.head_dim,
            self.config.num_features,
            self.config.kernel,
            self.config.causal,
            self.config.use_orthogonal_features,
            self.config.regularize_feature_norms,
            self.config.feature_redraw_interval,
            self.config.redraw_stochastically,
            self.config.fallback,
            self.dtype,
            self.device.location(),
        );
    }

    fn redraw_if_needed(&mut self) -> AttentionResult<()> {
        let decision = self
            .scheduler
            .decide(!self.features.is_empty(), &mut self.rng);
        if decision.redraws() {
            self.redraw()?;
        }
        self.scheduler.commit(decision);
        if decision == RedrawDecision::Initial {
            log::debug!("attention::performer drew initial random features");
        }
        Ok(())
    }

    fn redraw(&mut self) -> AttentionResult<()> {
        let tensor = self
            .generator
            .generate(&mut self.rng, &self.device, self.dtype)?;
        let version = self.features.replace(tensor);
        log::debug!("attention::performer random features version={version}");
        if self.training && self.config.redraw_verbose {
            log::info!("redrew random features");
        }
        Ok(())
    }

    fn split_heads(&self, tensor: &Tensor) -> AttentionResult<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        Ok(tensor
            .reshape((batch, seq, self.config.num_heads, self.config.head_dim))?
            .permute((0, 2, 1, 3))?)
    }

    fn finalize(&self, context: &Tensor, head_mask: Option<&Tensor>) -> AttentionResult<Tensor> {
        let (batch, heads, seq, head_dim) = context.dims4()?;
        let context = match head_mask {
            None => context.clone(),
            Some(mask) if mask.rank() == 1 => {
                if mask.dim(0)? != heads {
                    return Err(AttentionError::shape(format!(
                        "head mask has {} entries for {heads} heads",
                        mask.dim(0)?
                    )));
                }
                let mask = mask.to_dtype(context.dtype())?.reshape((1, heads, 1, 1))?;
                context.broadcast_mul(&mask)?
            }
            Some(mask) => context
                .broadcast_mul(&mask.to_dtype(context.dtype())?)
                .map_err(|e| AttentionError::shape(format!("head mask: {e}")))?,
        };
        let merged = context
            .permute((0, 2, 1, 3))?
            .reshape((batch, seq, heads * head_dim))?;
        Ok(self.out_lin.forward(&merged)?)
    }
}

fn project(layer: Option<&Linear>, input: &Tensor) -> AttentionResult<Tensor> {
    match layer {
        Some(layer) => Ok(layer.forward(input)?),
        None => Ok(input.clone()),
    }
}
