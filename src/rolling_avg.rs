use std::collections::VecDeque;

/// Fixed-size sliding window mean.
#[derive(Debug, Clone)]
pub struct RollingAvg {
    window: usize,
    history: VecDeque<f32>,
    sum: f32,
}

impl RollingAvg {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);

        Self {
            window,
            history: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.sum = 0.0;
    }

    /// Pushes a sample and returns the mean over the current window.
    pub fn push(&mut self, value: f32) -> f32 {
        if self.history.len() == self.window {
            if let Some(old) = self.history.pop_front() {
                self.sum -= old;
            }
        }

        self.history.push_back(value);
        self.sum += value;

        self.mean().unwrap_or(value)
    }

    #[inline]
    pub fn mean(&self) -> Option<f32> {
        if self.history.is_empty() {
            None
        } else {
            // guard against float drift pushing the mean below zero
            Some((self.sum / self.history.len() as f32).max(0.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_over_window_only() {
        let mut avg = RollingAvg::new(3);
        avg.push(3.0);
        avg.push(3.0);
        avg.push(3.0);
        assert_eq!(avg.push(9.0), 5.0);
        assert_eq!(avg.push(9.0), 7.0);
    }

    #[test]
    fn empty_has_no_mean() {
        let avg = RollingAvg::new(4);
        assert!(avg.mean().is_none());
    }
}
