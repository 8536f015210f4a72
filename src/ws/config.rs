#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Constant;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_DELAY_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Configuration for connection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between liveness probes. [`Duration::ZERO`] disables the
    /// heartbeat entirely.
    pub heartbeat_interval: Duration,
    /// Deadline for a probe acknowledgment. `None` means acknowledgments are
    /// tracked but staleness is never acted on; the transport's own close
    /// events are relied on instead. `Some(t)` tears the session down when no
    /// acknowledgment arrives within `t`, which then flows through the normal
    /// reconnect sequence.
    pub heartbeat_timeout: Option<Duration>,
    /// Whether an unexpected close triggers the automatic reconnect sequence.
    pub auto_reconnect: bool,
    /// Reconnection strategy configuration.
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            heartbeat_timeout: None,
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The delay between attempts is constant; once `max_attempts` consecutive
/// attempts have failed the connection is closed for good and no further
/// timer is scheduled.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    pub max_attempts: u32,
    /// Delay before each reconnection attempt.
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY_DURATION,
        }
    }
}

impl From<ReconnectConfig> for Constant {
    fn from(config: ReconnectConfig) -> Self {
        Constant::new(config.delay)
    }
}
