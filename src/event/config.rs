use std::time::Duration;

use typed_builder::TypedBuilder;

use super::error::Error;

pub const DEFAULT_REQUEST_QUEUE_SIZE: usize = 30;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How a request picks its target channels out of the registry snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Push to every live channel; the first response wins and the rest are
    /// discarded as unsolicited.
    #[default]
    Broadcast,
    /// Push to a single live channel, rotating through the snapshot in
    /// connection order.
    RoundRobin,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct Config {
    /// Capacity of each channel's outbound queue. Pushing into a full queue
    /// fails instead of waiting.
    #[builder(default = DEFAULT_REQUEST_QUEUE_SIZE)]
    pub request_queue_size: usize,
    /// Upper bound on how long a request waits for its response when the
    /// caller never cancels.
    #[builder(default = DEFAULT_REQUEST_TIMEOUT)]
    pub request_timeout: Duration,
    #[builder(default)]
    pub selection: SelectionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.request_queue_size == 0 {
            return Err(Error::InvalidConfig("request_queue_size must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request_timeout must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.request_queue_size, DEFAULT_REQUEST_QUEUE_SIZE);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.selection, SelectionPolicy::Broadcast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_queue() {
        let config = Config::builder().request_queue_size(0).build();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = Config::builder().request_timeout(Duration::ZERO).build();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
