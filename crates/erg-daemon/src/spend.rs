use serde::Serialize;
use std::sync::Mutex;

/// Cumulative agent spend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Spend {
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Daemon-wide spend counters with an optional budget. All mutation goes
/// through [`SpendTotals::record`].
pub struct SpendTotals {
    budget: Option<f64>,
    inner: Mutex<Spend>,
}

impl SpendTotals {
    pub fn new(budget: Option<f64>) -> Self {
        Self {
            budget,
            inner: Mutex::new(Spend::default()),
        }
    }

    pub fn record(&self, cost_usd: f64, output_tokens: u64, input_tokens: u64) {
        let mut spend = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        spend.cost_usd += cost_usd;
        spend.output_tokens += output_tokens;
        spend.input_tokens += input_tokens;
    }

    pub fn snapshot(&self) -> Spend {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_exhausted(&self) -> bool {
        let spent = self.snapshot().cost_usd;
        self.budget.map(|b| spent >= b).unwrap_or(false)
    }
}
