use anyhow::Result;
use ironshuffle::ShuffleConf;
use ironshuffle::testing::LocalCluster;

/// Route the crate's logs through the test harness; `RUST_LOG` picks the level.
pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .parse_env("RUST_LOG")
        .is_test(true)
        .try_init();
}

/// A local cluster, with logging installed.
pub fn cluster(num_executors: usize, conf: ShuffleConf) -> Result<LocalCluster> {
    init_logging();
    LocalCluster::new(num_executors, conf)
}
