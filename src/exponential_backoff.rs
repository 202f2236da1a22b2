use std::cmp::min;
use crate::config::RdmConfig;

/// Backoff for peers that reported RNR ("receiver not ready"). It counts progress rounds rather
///  than wall clock time since the endpoint only makes progress when it is driven anyway.
pub struct ExponentialBackoff {
    counter: usize,
    retry_threshold: usize,

    config_initial_threshold: usize,
    config_max_threshold: usize,
    config_threshold_factor_eighths: usize,
}

impl ExponentialBackoff {
    pub fn new(config: &RdmConfig) -> Self {
        let result = ExponentialBackoff {
            counter: 0,
            retry_threshold: config.rnr_backoff_initial_rounds,
            config_initial_threshold: config.rnr_backoff_initial_rounds,
            config_max_threshold: config.rnr_backoff_max_rounds,
            config_threshold_factor_eighths: config.rnr_backoff_factor_eighths,
        };

        assert!(result.config_threshold_factor_eighths >= 8);

        result
    }

    /// Counts a progress round, returning true if the peer may be retried in this round. Every
    ///  retry makes the next wait longer until [ExponentialBackoff::reset] is called.
    #[must_use]
    pub fn should_retry(&mut self) -> bool {
        self.counter += 1;
        if self.counter < self.retry_threshold {
            return false;
        }

        self.counter = 0;
        self.retry_threshold = (self.retry_threshold * self.config_threshold_factor_eighths) >> 3;
        self.retry_threshold = min(self.retry_threshold, self.config_max_threshold);
        true
    }

    pub fn reset(&mut self) {
        self.counter = 0;
        self.retry_threshold = self.config_initial_threshold;
    }
}
