//! Random feature machinery for FAVOR+.
//!
//! * [`generator`] draws the `M x d_head` projection matrix.
//! * [`kernel`] maps projected queries/keys to positive prime features.
//! * [`redraw`] owns the current matrix and decides when to replace it.

pub mod generator;
pub mod kernel;
pub mod redraw;

pub use generator::{num_random_features, RandomFeatureGenerator};
pub use kernel::{KernelFeatureMap, KernelType};
pub use redraw::{FeatureMatrix, FeatureRedrawScheduler, FeatureStore, RedrawDecision};
