use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{ApiStatusError, BotApi, Update};

/// Backoff configuration for the manual long-poll loop.
const BACKOFF_BASE_SECS: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 1.8;
const BACKOFF_CAP_SECS: f64 = 30.0;
/// Give up after this much cumulative backoff time.
const RETRY_BUDGET: Duration = Duration::from_secs(30 * 60);
/// A conflict response means another poller owns the update stream; after
/// this many in a row the native loop has recovered and we bow out.
const CONFLICT_EXIT_THRESHOLD: u32 = 10;

const POLL_TIMEOUT_SECS: u64 = 25;

/// Resilient update receiver. Long-polls `getUpdates` and forwards each
/// update to the channel; the offset is persisted to disk so a restart
/// resumes where the previous process stopped.
pub struct UpdatePoller {
    api: BotApi,
    offset_path: Option<PathBuf>,
}

impl UpdatePoller {
    pub fn new(api: BotApi, offset_path: Option<PathBuf>) -> Self {
        Self { api, offset_path }
    }

    fn load_offset(&self) -> i64 {
        let Some(path) = &self.offset_path else {
            return 0;
        };
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn store_offset(&self, offset: i64) {
        if let Some(path) = &self.offset_path
            && let Err(e) = std::fs::write(path, offset.to_string())
        {
            tracing::warn!(error = %e, "Failed to persist update offset");
        }
    }

    /// Run until cancelled, the channel closes, the retry budget is spent,
    /// or a native poller reclaims the stream (consecutive conflicts).
    pub async fn run(&self, tx: mpsc::Sender<Update>, cancel: CancellationToken) -> Result<()> {
        let mut offset = self.load_offset();
        let mut backoff_secs = BACKOFF_BASE_SECS;
        let mut spent_backing_off = Duration::ZERO;
        let mut consecutive_conflicts = 0u32;

        loop {
            let batch = tokio::select! {
                r = self.api.get_updates(offset, POLL_TIMEOUT_SECS) => r,
                _ = cancel.cancelled() => {
                    tracing::info!("Update poller cancelled");
                    return Ok(());
                }
            };

            match batch {
                Ok(updates) => {
                    backoff_secs = BACKOFF_BASE_SECS;
                    spent_backing_off = Duration::ZERO;
                    consecutive_conflicts = 0;

                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if tx.send(update).await.is_err() {
                            tracing::info!("Update channel closed, poller exiting");
                            self.store_offset(offset);
                            return Ok(());
                        }
                    }
                    self.store_offset(offset);
                }
                Err(e) => {
                    if let Some(status) = e.downcast_ref::<ApiStatusError>()
                        && status.is_conflict()
                    {
                        consecutive_conflicts += 1;
                        if consecutive_conflicts >= CONFLICT_EXIT_THRESHOLD {
                            tracing::info!(
                                conflicts = consecutive_conflicts,
                                "Native poll loop recovered, manual poller exiting"
                            );
                            return Ok(());
                        }
                    } else {
                        consecutive_conflicts = 0;
                    }

                    if spent_backing_off >= RETRY_BUDGET {
                        return Err(anyhow::anyhow!(
                            "update poller exhausted its retry budget: {}",
                            e
                        ));
                    }

                    // 0-25% jitter, derived from the clock so concurrent
                    // workers don't hammer the API in lockstep.
                    let jitter_ms = ((backoff_secs * 250.0) as u64).max(1);
                    let jitter = (std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64)
                        % jitter_ms;
                    let delay =
                        Duration::from_secs_f64(backoff_secs) + Duration::from_millis(jitter);

                    tracing::warn!(
                        error = %e,
                        backoff_secs = backoff_secs,
                        jitter_ms = jitter,
                        "Long poll failed, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Ok(()),
                    }
                    spent_backing_off += delay;
                    backoff_secs = (backoff_secs * BACKOFF_FACTOR).min(BACKOFF_CAP_SECS);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_caps() {
        let mut secs = BACKOFF_BASE_SECS;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(secs);
            secs = (secs * BACKOFF_FACTOR).min(BACKOFF_CAP_SECS);
        }
        assert_eq!(seen[0], 2.0);
        assert!((seen[1] - 3.6).abs() < 1e-9);
        assert!(seen.iter().all(|s| *s <= BACKOFF_CAP_SECS));
        assert_eq!(*seen.last().unwrap(), BACKOFF_CAP_SECS);
    }

    #[test]
    fn offset_round_trips_through_file() {
        let dir = std::env::temp_dir().join(format!("poller-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("offset");

        let api = BotApi::new("http://localhost:1", "t").unwrap();
        let poller = UpdatePoller::new(api, Some(path.clone()));
        assert_eq!(poller.load_offset(), 0);
        poller.store_offset(4711);
        assert_eq!(poller.load_offset(), 4711);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
