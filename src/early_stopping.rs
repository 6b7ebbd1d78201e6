/// Stops training once enough earlier epochs reached a lower loss than the
/// current one.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    patience: usize,
    history: Vec<f64>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            history: Vec::new(),
        }
    }

    /// Records the loss of the epoch that just finished and returns `true`
    /// when at least `patience` recorded losses are strictly lower.
    pub fn record(&mut self, loss: f64) -> bool {
        self.history.push(loss);

        let lower = self.history.iter().filter(|&&l| l < loss).count();
        lower >= self.patience
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }

    pub fn best(&self) -> Option<f64> {
        self.history.iter().copied().reduce(f64::min)
    }
}
