//! Shared support code for the integration tests.

use std::time::Duration;

use dist_server::ObjectServer;

/// Seconds per server frame at the 60 hz test tick rate.
pub const FRAME: f64 = 1.0 / 60.0;

/// Steps the server for `frames` fixed-rate frames, yielding between steps so
/// the accept and reader tasks make progress.
pub async fn pump(server: &mut ObjectServer, frames: u32) -> anyhow::Result<()> {
    for _ in 0..frames {
        server.step(FRAME).await?;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    Ok(())
}

/// Installs a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}
