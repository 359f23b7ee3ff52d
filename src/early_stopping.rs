//! Patience-based early stopping over the history of a validation metric.
use std::f64;

/// Best value of `history`, and whether training should stop.
///
/// Training stops when the most recent occurrence of the best value lies
/// more than `patience` entries before the last entry. An empty history
/// never stops and has a best value of negative infinity.
pub fn should_stop(history: &[f64], patience: usize) -> (f64, bool) {
    let best = history.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let stop = match history.iter().rposition(|&value| value == best) {
        Some(best_idx) => history.len() - 1 - best_idx > patience,
        None => false,
    };

    (best, stop)
}

/// What to do after recording an evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The value is strictly better than every earlier one: checkpoint.
    Improved,
    /// Keep training.
    Continue,
    /// Patience exhausted.
    Stop,
}

/// Tracks a metric history and the entry worth keeping.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    patience: usize,
    history: Vec<f64>,
    best_idx: Option<usize>,
}

impl EarlyStopping {
    /// Stop once `patience` evaluations pass without reaching the best value.
    pub fn new(patience: usize) -> Self {
        EarlyStopping {
            patience: patience,
            history: Vec::new(),
            best_idx: None,
        }
    }

    /// Record the next value.
    pub fn record(&mut self, value: f64) -> Decision {
        let improved = self.history.iter().all(|&previous| value > previous);

        self.history.push(value);

        let (_, stop) = should_stop(&self.history, self.patience);

        if stop {
            Decision::Stop
        } else if improved {
            self.best_idx = Some(self.history.len() - 1);
            Decision::Improved
        } else {
            Decision::Continue
        }
    }

    /// Values recorded so far.
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// Position and value of the last strict improvement.
    pub fn best(&self) -> Option<(usize, f64)> {
        self.best_idx.map(|idx| (idx, self.history[idx]))
    }
}
