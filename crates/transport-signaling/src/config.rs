use std::time::Duration;

use crate::ConnectError;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Tuning for a relay connection.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// How long the relay has to acknowledge the join.
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl SignalingConfig {
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.join_timeout.is_zero() {
            return Err(ConnectError::InvalidConfig {
                field: "join timeout",
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConnectError::InvalidConfig {
                field: "heartbeat interval",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timers_are_rejected() {
        assert!(SignalingConfig::default().validate().is_ok());
        let config = SignalingConfig::default().with_heartbeat_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConnectError::InvalidConfig {
                field: "heartbeat interval"
            })
        ));
        let config = SignalingConfig {
            join_timeout: Duration::ZERO,
            ..SignalingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConnectError::InvalidConfig {
                field: "join timeout"
            })
        ));
    }
}
