pub mod db;
pub mod factory;
pub mod test_runner;

use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once. Filtered through `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds, panicking after a few seconds
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    if tokio::time::timeout(Duration::from_secs(10), polling).await.is_err() {
        panic!("timed out waiting until {description}");
    }
}
