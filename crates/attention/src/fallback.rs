//! Policy deciding when exact softmax attention replaces FAVOR+.
//!
//! For short sequences the random-feature path costs more than it saves, and
//! since FAVOR+ is an unbiased estimator of softmax attention the exact path
//! can stand in for it. The decision is a pure function of the sequence
//! length `L`, the feature count `M` and the training flag.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};

use crate::core::errors::AttentionError;

/// Caller-supplied fallback predicate `(seq_len, num_features, training) -> bool`.
pub type FallbackFn = Arc<dyn Fn(usize, usize, bool) -> bool + Send + Sync>;

/// Named fallback behaviours plus an escape hatch for custom predicates.
#[derive(Clone)]
pub enum ShortSequenceBehavior {
    /// Use softmax only in evaluation mode, and only when `L < 2M`.
    UseSoftmaxEvalOnly,
    /// Use softmax in both modes when `L < 2M`.
    UseSoftmaxEvalAndTrain,
    /// Always use FAVOR+. Required by the relu kernel.
    NeverUseSoftmax,
    /// Arbitrary predicate; only constructible programmatically.
    Custom(FallbackFn),
}

impl ShortSequenceBehavior {
    /// Wraps a custom predicate.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(usize, usize, bool) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Returns `true` when exact softmax attention should run instead of FAVOR+.
    pub fn should_fallback(&self, seq_len: usize, num_features: usize, training: bool) -> bool {
        let short = seq_len < 2 * num_features;
        match self {
            Self::UseSoftmaxEvalOnly => !training && short,
            Self::UseSoftmaxEvalAndTrain => short,
            Self::NeverUseSoftmax => false,
            Self::Custom(predicate) => predicate(seq_len, num_features, training),
        }
    }

    /// Configuration name of the behaviour.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UseSoftmaxEvalOnly => "use_softmax_eval_only",
            Self::UseSoftmaxEvalAndTrain => "use_softmax_eval_and_train",
            Self::NeverUseSoftmax => "never_use_softmax",
            Self::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for ShortSequenceBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ShortSequenceBehavior {
    type Err = AttentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "use_softmax_eval_only" => Ok(Self::UseSoftmaxEvalOnly),
            "use_softmax_eval_and_train" => Ok(Self::UseSoftmaxEvalAndTrain),
            "never_use_softmax" => Ok(Self::NeverUseSoftmax),
            other => Err(AttentionError::InvalidConfig(format!(
                "unknown short_sequence_behavior '{other}'"
            ))),
        }
    }
}

impl Serialize for ShortSequenceBehavior {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Custom(_) => Err(ser::Error::custom(
                "custom short_sequence_behavior cannot be serialised",
            )),
            named => serializer.serialize_str(named.name()),
        }
    }
}

impl<'de> Deserialize<'de> for ShortSequenceBehavior {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BehaviorVisitor;

        impl Visitor<'_> for BehaviorVisitor {
            type Value = ShortSequenceBehavior;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a short_sequence_behavior name string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(BehaviorVisitor)
    }
}
