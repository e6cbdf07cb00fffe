//! Feature matrix ownership and the redraw schedule.
//!
//! The scheduler counts forward passes served since the last draw. With an
//! interval of `k` the matrix is replaced on calls `1, k + 1, 2k + 1, ...` so
//! every matrix serves exactly `k` passes. Stochastic mode replaces the fixed
//! schedule with a `1 / k` coin flip per call.
//!
//! [`FeatureStore`] builds the replacement before publishing it: a failed draw
//! leaves the previous matrix untouched.

use std::num::NonZeroUsize;

use candle_core::Tensor;
use rand::Rng;

/// Why a forward pass did or did not draw a new matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedrawDecision {
    /// No matrix exists yet.
    Initial,
    /// The fixed interval elapsed.
    Scheduled,
    /// The stochastic coin flip succeeded.
    Stochastic,
    /// Keep the current matrix.
    Keep,
}

impl RedrawDecision {
    pub fn redraws(self) -> bool {
        !matches!(self, Self::Keep)
    }
}

#[derive(Debug, Clone)]
pub struct FeatureRedrawScheduler {
    interval: Option<NonZeroUsize>,
    stochastic: bool,
    calls_since_redraw: usize,
}

impl FeatureRedrawScheduler {
    pub fn new(interval: Option<NonZeroUsize>, stochastic: bool) -> Self {
        Self {
            interval,
            stochastic,
            calls_since_redraw: 0,
        }
    }

    /// Decides whether the upcoming pass needs a fresh matrix.
    ///
    /// The count is left alone until [`commit`](Self::commit), so a failed
    /// draw keeps the redraw pending.
    pub fn decide<R: Rng + ?Sized>(&self, has_matrix: bool, rng: &mut R) -> RedrawDecision {
        if !has_matrix {
            return RedrawDecision::Initial;
        }
        match self.interval {
            None => RedrawDecision::Keep,
            Some(interval) if self.stochastic => {
                if rng.gen_bool(1.0 / interval.get() as f64) {
                    RedrawDecision::Stochastic
                } else {
                    RedrawDecision::Keep
                }
            }
            Some(interval) if self.calls_since_redraw >= interval.get() => {
                RedrawDecision::Scheduled
            }
            Some(_) => RedrawDecision::Keep,
        }
    }

    /// Records a pass served after `decision` was carried out.
    pub fn commit(&mut self, decision: RedrawDecision) {
        if decision.redraws() {
            self.calls_since_redraw = 0;
        }
        self.calls_since_redraw += 1;
    }

    /// Restarts the count after an out-of-band redraw.
    pub fn mark_redrawn(&mut self) {
        self.calls_since_redraw = 0;
    }

    pub fn calls_since_last_redraw(&self) -> usize {
        self.calls_since_redraw
    }
}

/// A published feature matrix and its draw number.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub tensor: Tensor,
    /// 1 for the first draw, incremented on every replacement.
    pub version: u64,
}

#[derive(Debug, Default)]
pub struct FeatureStore {
    current: Option<FeatureMatrix>,
}

impl FeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&FeatureMatrix> {
        self.current.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Publishes `tensor` and returns its version.
    pub fn replace(&mut self, tensor: Tensor) -> u64 {
        let version = self.current.as_ref().map_or(1, |m| m.version + 1);
        self.current = Some(FeatureMatrix { tensor, version });
        version
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn run(scheduler: &mut FeatureRedrawScheduler, calls: usize) -> Vec<RedrawDecision> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut has_matrix = false;
        (0..calls)
            .map(|_| {
                let decision = scheduler.decide(has_matrix, &mut rng);
                scheduler.commit(decision);
                has_matrix = true;
                decision
            })
            .collect()
    }

    #[test]
    fn fixed_interval_redraws_every_k_calls() {
        let mut scheduler = FeatureRedrawScheduler::new(NonZeroUsize::new(3), false);
        let redraw_calls: Vec<usize> = run(&mut scheduler, 10)
            .iter()
            .enumerate()
            .filter(|(_, d)| d.redraws())
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(redraw_calls, vec![1, 4, 7, 10]);
    }

    #[test]
    fn interval_of_one_redraws_every_call() {
        let mut scheduler = FeatureRedrawScheduler::new(NonZeroUsize::new(1), false);
        assert!(run(&mut scheduler, 5).iter().all(|d| d.redraws()));
    }

    #[test]
    fn no_interval_draws_once() {
        let mut scheduler = FeatureRedrawScheduler::new(None, false);
        let decisions = run(&mut scheduler, 50);
        assert_eq!(decisions[0], RedrawDecision::Initial);
        assert!(decisions[1..].iter().all(|d| *d == RedrawDecision::Keep));
    }

    #[test]
    fn stochastic_rate_tracks_interval() {
        let mut scheduler = FeatureRedrawScheduler::new(NonZeroUsize::new(4), true);
        let decisions = run(&mut scheduler, 4001);
        let hits = decisions[1..]
            .iter()
            .filter(|d| **d == RedrawDecision::Stochastic)
            .count();
        assert!((800..1200).contains(&hits), "hits = {hits}");
        assert!(!decisions.contains(&RedrawDecision::Scheduled));
    }

    #[test]
    fn manual_redraw_restarts_the_count() {
        let mut scheduler = FeatureRedrawScheduler::new(NonZeroUsize::new(2), false);
        let mut rng = StdRng::seed_from_u64(0);
        let mut step = |scheduler: &mut FeatureRedrawScheduler, has_matrix: bool| {
            let decision = scheduler.decide(has_matrix, &mut rng);
            scheduler.commit(decision);
            decision.redraws()
        };
        assert!(step(&mut scheduler, false));
        assert!(!step(&mut scheduler, true));
        scheduler.mark_redrawn();
        assert!(!step(&mut scheduler, true));
        assert!(!step(&mut scheduler, true));
        assert!(step(&mut scheduler, true));
    }

    #[test]
    fn uncommitted_redraw_stays_pending() {
        let mut scheduler = FeatureRedrawScheduler::new(NonZeroUsize::new(2), false);
        let mut rng = StdRng::seed_from_u64(0);
        scheduler.commit(scheduler.decide(false, &mut rng));
        scheduler.commit(scheduler.decide(true, &mut rng));
        // The scheduled draw fails, so nothing is committed.
        assert_eq!(scheduler.decide(true, &mut rng), RedrawDecision::Scheduled);
        assert_eq!(scheduler.calls_since_last_redraw(), 2);
        assert_eq!(scheduler.decide(true, &mut rng), RedrawDecision::Scheduled);
        scheduler.commit(RedrawDecision::Scheduled);
        assert_eq!(scheduler.calls_since_last_redraw(), 1);
        assert_eq!(scheduler.decide(true, &mut rng), RedrawDecision::Keep);
    }

    #[test]
    fn store_versions_each_replacement() -> candle_core::Result<()> {
        let mut store = FeatureStore::new();
        assert!(store.is_empty());
        let first = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        let second = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
        assert_eq!(store.replace(first), 1);
        assert_eq!(store.replace(second), 2);
        let current = store.current().expect("matrix published");
        assert_eq!(current.version, 2);
        assert_eq!(current.tensor.sum_all()?.to_scalar::<f32>()?, 4.0);
        Ok(())
    }
}
