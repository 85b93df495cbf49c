//! Systemd watchdog heartbeat.
//!
//! Sends `READY=1` once, then `WATCHDOG=1` on a fixed interval, then
//! `STOPPING=1` on deliberate shutdown, to the systemd notify socket.
//! Silently no-ops when `NOTIFY_SOCKET` is unset (dev mode / non-systemd
//! hosts), matching the behavior of the original asyncio watchdog loop.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_INTERVAL_SECS: u64 = 20;

/// Sends `READY=1`, then loops sending `WATCHDOG=1` every `interval`
/// until `token` is cancelled, at which point it sends `STOPPING=1` and
/// returns.
pub async fn watchdog_loop(token: CancellationToken, interval: Duration) {
    notify_ready();
    tracing::info!("watchdog started (interval={:?})", interval);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                notify_watchdog();
            }
            _ = token.cancelled() => {
                notify_stopping();
                break;
            }
        }
    }
}

pub fn default_interval() -> Duration {
    Duration::from_secs(DEFAULT_INTERVAL_SECS)
}

fn notify_ready() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        tracing::debug!("sd_notify READY=1 failed (not under systemd?): {}", e);
    }
}

fn notify_watchdog() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
        tracing::debug!("sd_notify WATCHDOG=1 failed: {}", e);
    }
}

fn notify_stopping() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]) {
        tracing::debug!("sd_notify STOPPING=1 failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stops_promptly_on_cancellation() {
        let token = CancellationToken::new();
        let token_clone = token.clone();
        let handle = tokio::spawn(watchdog_loop(token_clone, Duration::from_secs(3600)));
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }
}
