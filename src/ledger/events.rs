//! Ledger event polling with a persisted cursor
//!
//! A polling loop pulls logs from `last_seen_block + 1` to `current_block`
//! and forwards typed events to the orchestrator in block order. The cursor
//! (last seen block) is the only state Corridor persists: on restart the
//! poller backfills everything the process missed while down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Ledger, LedgerEvent};

/// Queue depth between the poller and the orchestrator
const EVENT_QUEUE_CAPACITY: usize = 512;

#[derive(serde::Serialize, serde::Deserialize)]
struct CursorFile {
    last_block: u64,
}

/// Load the persisted poll cursor, if any
pub fn load_cursor(path: &Path) -> Option<u64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let cursor: CursorFile = serde_json::from_str(&raw).ok()?;
    Some(cursor.last_block)
}

/// Persist the poll cursor
pub fn store_cursor(path: &Path, last_block: u64) -> std::io::Result<()> {
    let body = serde_json::to_string(&CursorFile { last_block })
        .expect("cursor serialization cannot fail");
    std::fs::write(path, body)
}

/// Configuration for the event poller
pub struct PollerConfig {
    pub interval: Duration,
    pub cursor_path: PathBuf,
}

/// Ledger event poller
pub struct EventPoller {
    ledger: Arc<dyn Ledger>,
    config: PollerConfig,
    shutdown: watch::Receiver<bool>,
}

impl EventPoller {
    pub fn new(ledger: Arc<dyn Ledger>, config: PollerConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            ledger,
            config,
            shutdown,
        }
    }

    /// Spawn the poll loop; returns the typed-event receiver and the task
    /// handle. The cursor is persisted after every successful poll and once
    /// more on shutdown.
    pub fn spawn(self) -> (mpsc::Receiver<LedgerEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let handle = tokio::spawn(async move {
            let mut cursor = load_cursor(&self.config.cursor_path);
            match cursor {
                Some(block) => info!(last_block = block, "Resuming event poll from cursor"),
                None => info!("No poll cursor found, starting from the chain head"),
            }

            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut shutdown = self.shutdown.clone();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let head = match self.ledger.block_number().await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "Block number query failed, will retry");
                        continue;
                    }
                };

                // First run without a cursor: start at the head, do not
                // replay the whole chain.
                let from = match cursor {
                    Some(last) if last < head => last + 1,
                    Some(_) => continue,
                    None => {
                        cursor = Some(head);
                        if let Err(e) = store_cursor(&self.config.cursor_path, head) {
                            warn!(error = %e, "Failed to persist poll cursor");
                        }
                        continue;
                    }
                };

                match self.ledger.get_events(from, head).await {
                    Ok(events) => {
                        debug!(from, to = head, count = events.len(), "Polled ledger events");
                        for event in events {
                            if tx.send(event).await.is_err() {
                                error!("Event consumer gone, stopping poller");
                                return;
                            }
                        }
                        cursor = Some(head);
                        if let Err(e) = store_cursor(&self.config.cursor_path, head) {
                            warn!(error = %e, "Failed to persist poll cursor");
                        }
                    }
                    Err(e) => {
                        warn!(from, to = head, error = %e, "Event poll failed, will retry");
                    }
                }
            }

            if let Some(block) = cursor {
                if let Err(e) = store_cursor(&self.config.cursor_path, block) {
                    error!(error = %e, "Failed to persist poll cursor on shutdown");
                } else {
                    info!(last_block = block, "Poll cursor persisted on shutdown");
                }
            }
        });

        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let dir = std::env::temp_dir().join(format!("corridor-cursor-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cursor.json");

        assert_eq!(load_cursor(&path), None);
        store_cursor(&path, 4711).unwrap();
        assert_eq!(load_cursor(&path), Some(4711));
        store_cursor(&path, 4712).unwrap();
        assert_eq!(load_cursor(&path), Some(4712));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_cursor_is_ignored() {
        let dir = std::env::temp_dir().join(format!("corridor-cursor-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cursor.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load_cursor(&path), None);
        std::fs::remove_dir_all(&dir).ok();
    }
}
