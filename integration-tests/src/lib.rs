pub mod cluster;
pub mod lab;

use std::time::Duration;

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `f` every 20 ms until it returns `Some` or `timeout` elapses.
pub async fn eventually<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(x) = f() {
            return Some(x);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
