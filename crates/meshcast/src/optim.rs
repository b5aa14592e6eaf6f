//! Stochastic gradient descent with a piecewise-constant schedule.

use ndarray::ArrayD;

use crate::{Error, Result};

/// A learning rate that stays constant between step boundaries.
///
/// `boundaries` must be strictly increasing and `values` must hold exactly
/// one more entry than `boundaries`: `values[i]` applies while the step count
/// is below `boundaries[i]`, and the last value applies forever after. An
/// empty boundary list gives a constant rate.
#[derive(Clone, Debug)]
pub struct PiecewiseConstantScheduler {
    boundaries: Vec<usize>,
    values: Vec<f64>,
}

impl PiecewiseConstantScheduler {
    /// Builds a schedule from boundaries and per-interval values.
    pub fn new(boundaries: Vec<usize>, values: Vec<f64>) -> Result<Self> {
        if values.len() != boundaries.len() + 1 {
            return Err(Error::Optim(format!(
                "expected {} learning-rate values for {} boundaries, got {}",
                boundaries.len() + 1,
                boundaries.len(),
                values.len(),
            )));
        }
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Optim(
                "schedule boundaries must be strictly increasing".into(),
            ));
        }
        Ok(Self { boundaries, values })
    }

    /// The learning rate in effect at `step`.
    pub fn learning_rate(&self, step: usize) -> f64 {
        for (i, &boundary) in self.boundaries.iter().enumerate() {
            if step < boundary {
                return self.values[i];
            }
        }
        self.values[self.boundaries.len()]
    }
}

/// Stochastic gradient descent with optional momentum.
#[derive(Clone, Debug)]
pub struct Sgd {
    scheduler: PiecewiseConstantScheduler,
    momentum: f64,
}

impl Sgd {
    /// Creates an optimizer from a schedule and a momentum coefficient.
    pub fn new(scheduler: PiecewiseConstantScheduler, momentum: f64) -> Self {
        Self {
            scheduler,
            momentum,
        }
    }

    /// The momentum coefficient.
    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    /// Applies one update in place.
    ///
    /// `buffer` carries the momentum state across steps; it is ignored (but
    /// left untouched) when momentum is zero.
    pub(crate) fn update(
        &self,
        step: usize,
        param: &mut ArrayD<f32>,
        grad: &ArrayD<f32>,
        buffer: &mut ArrayD<f32>,
    ) {
        let lr = self.scheduler.learning_rate(step) as f32;
        if self.momentum != 0.0 {
            let mu = self.momentum as f32;
            buffer.zip_mut_with(grad, |m, &g| *m = mu * *m + g);
            param.zip_mut_with(buffer, |p, &m| *p -= lr * m);
        } else {
            param.zip_mut_with(grad, |p, &g| *p -= lr * g);
        }
    }
}
