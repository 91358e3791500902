use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn spawn(f: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(f);
}

/// Milliseconds since the unix epoch, used for cache entry timestamps.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
