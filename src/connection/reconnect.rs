use std::time::Duration;

/// How the delay grows between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every attempt
    Fixed,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

/// When and how often to reopen a socket after it closes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(2000);
    pub const STANDALONE_MAX_ATTEMPTS: u32 = 5;

    /// Exponential backoff capped at five attempts
    pub fn standalone() -> Self {
        Self {
            enabled: true,
            base_delay: Self::DEFAULT_DELAY,
            backoff: Backoff::Exponential,
            max_attempts: Some(Self::STANDALONE_MAX_ATTEMPTS),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the 1-based `attempt`, or `None` if it must not be made
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt == 0 {
            return None;
        }

        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }

        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };

        Some(delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Self::DEFAULT_DELAY,
            backoff: Backoff::Fixed,
            max_attempts: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_and_unbounded() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_for(50), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn test_standalone_backoff() {
        let policy = ReconnectPolicy::standalone();
        let delays: Vec<_> = (1..=6).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(2000)),
                Some(Duration::from_millis(4000)),
                Some(Duration::from_millis(8000)),
                Some(Duration::from_millis(16000)),
                Some(Duration::from_millis(32000)),
                None,
            ]
        );
    }

    #[test]
    fn test_disabled_never_retries() {
        assert_eq!(ReconnectPolicy::disabled().delay_for(1), None);
    }
}
