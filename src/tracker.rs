use crate::model::{Evaluation, ScoreDirection};

/// Running best judgment metric.
#[derive(Debug, Clone, Copy)]
pub struct BestSoFar {
    direction: ScoreDirection,
    best: Option<f64>,
}

impl BestSoFar {
    pub fn new(direction: ScoreDirection) -> Self {
        Self {
            direction,
            best: None,
        }
    }

    /// Folds one metric into the accumulator and returns the best seen so far.
    /// Undefined metrics (`None`, NaN) leave the accumulator untouched.
    pub fn observe(&mut self, metric: Option<f64>) -> Option<f64> {
        if let Some(value) = metric.filter(|value| !value.is_nan()) {
            self.best = match self.best {
                Some(best) if !self.direction.improves(value, best) => Some(best),
                _ => Some(value),
            };
        }
        self.best
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

/// Best-so-far series over evaluations already ordered by creation time.
///
/// Evaluations without a usable metric (errored, still running) get no
/// entry, so the series has one point per scored evaluation.
pub fn best_so_far(evaluations: &[Evaluation], direction: ScoreDirection) -> Vec<f64> {
    best_so_far_metrics(evaluations.iter().map(|evaluation| evaluation.metric), direction)
}

pub fn best_so_far_metrics<I>(metrics: I, direction: ScoreDirection) -> Vec<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut tracker = BestSoFar::new(direction);
    metrics
        .into_iter()
        .filter(|metric| metric.is_some_and(|value| !value.is_nan()))
        .filter_map(|metric| tracker.observe(metric))
        .collect()
}
