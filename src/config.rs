use std::time::Duration;

#[derive(Clone)]
pub struct RpcConfig {
    pub timeout: TimeoutSetting,
    pub breaker: BreakerConfig,
    /// Max calls admitted per second on the client side.
    pub max_client_rate: i64,
    /// Max requests admitted per second on the serve side.
    pub max_service_rate: i64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutSetting::default(),
            breaker: BreakerConfig::default(),
            max_client_rate: 100_000,
            max_service_rate: 100_000,
        }
    }
}

#[derive(Clone, Copy)]
pub struct TimeoutSetting {
    /// Dial timeout for a new connection.
    pub connect_timeout: Duration,
    /// Socket write timeout for one framed message.
    pub write_timeout: Duration,
    /// TTL applied when a caller's context carries no deadline.
    pub default_ttl: Duration,
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(5),
            default_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy)]
pub struct BreakerConfig {
    /// Statistics window; counters reset on every tick.
    pub tick: Duration,
    /// Minimum attempts within a window before the error rate is
    /// judged. The reference system ships both 100 and 10; default is
    /// the conservative 100.
    pub min_volume: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { tick: Duration::from_secs(2), min_volume: 100 }
    }
}
