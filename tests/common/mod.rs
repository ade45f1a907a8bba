use captains_log::recipe;
use log::Level;
use tokio::runtime::{Builder, Runtime};

use drover_rpc::{BreakerConfig, RpcConfig};

pub fn setup() -> Runtime {
    recipe::raw_file_logger("/tmp/drover_rpc_test.log", Level::Trace).test().build();
    Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap()
}

/// A config with a breaker that never ticks on its own, so tests drive
/// window sweeps deterministically.
pub fn test_config() -> RpcConfig {
    let mut config = RpcConfig::default();
    config.breaker = BreakerConfig {
        tick: std::time::Duration::from_secs(3600),
        min_volume: 10,
    };
    config
}
