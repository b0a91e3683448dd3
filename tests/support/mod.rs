#![allow(unused)]

pub mod mock;
pub mod server;

use std::time::Duration;

/// Lets every spawned task run to quiescence. Under a paused clock this only
/// moves time forward by a millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
