//! Descriptive statistics over the finite values of a column.

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    sorted: Vec<f64>,
}

impl Sample {
    pub fn finite(values: impl IntoIterator<Item = f64>) -> Self {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        Self { sorted }
    }

    pub fn values(&self) -> &[f64] {
        &self.sorted
    }

    pub fn min(&self) -> Option<f64> {
        self.sorted.first().copied()
    }

    pub fn max(&self) -> Option<f64> {
        self.sorted.last().copied()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        Some(self.sorted.iter().sum::<f64>() / self.sorted.len() as f64)
    }

    pub fn std(&self) -> Option<f64> {
        self.central_moment(2).map(f64::sqrt)
    }

    // q in percent.
    pub fn percentile(&self, q: f64) -> Option<f64> {
        let n = self.sorted.len();
        if n == 0 || !q.is_finite() {
            return None;
        }
        let rank = (q.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let lo_v = self.sorted[lo];
        let hi_v = self.sorted[hi];
        Some(lo_v + (hi_v - lo_v) * (rank - lo as f64))
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    pub fn mad(&self) -> Option<f64> {
        let median = self.median()?;
        Self::finite(self.sorted.iter().map(|v| (v - median).abs())).median()
    }

    pub fn skewness(&self) -> Option<f64> {
        let m2 = self.central_moment(2)?;
        let m3 = self.central_moment(3)?;
        let skew = m3 / m2.powf(1.5);
        skew.is_finite().then_some(skew)
    }

    pub fn excess_kurtosis(&self) -> Option<f64> {
        let m2 = self.central_moment(2)?;
        let m4 = self.central_moment(4)?;
        let kurt = m4 / (m2 * m2) - 3.0;
        kurt.is_finite().then_some(kurt)
    }

    fn central_moment(&self, order: i32) -> Option<f64> {
        let mean = self.mean()?;
        let sum: f64 = self.sorted.iter().map(|v| (v - mean).powi(order)).sum();
        Some(sum / self.sorted.len() as f64)
    }
}
