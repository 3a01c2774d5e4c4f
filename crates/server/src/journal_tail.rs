use std::time::Duration;

use chrono::Utc;
use shared::protocol::ServerEvent;
use storage::Storage;
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

const JOURNAL_BATCH: u32 = 256;
const JOURNAL_RETENTION_MINUTES: i64 = 10;
const PRUNE_EVERY_TICKS: u64 = 60;

/// Polls the change journal for writes made by other processes sharing the
/// database (operator tools, a second server) and publishes them as server
/// events. Writes made through this process arrive on the change bridge.
pub(crate) async fn spawn_journal_tail(
    storage: Storage,
    events: broadcast::Sender<ServerEvent>,
    every: Duration,
) -> anyhow::Result<JoinHandle<()>> {
    let mut cursor = storage.journal_head().await?;
    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;
        loop {
            ticker.tick().await;
            match forward_foreign_writes(&storage, &events, &mut cursor).await {
                Ok(0) => {}
                Ok(forwarded) => debug!(forwarded, cursor, "forwarded external writes"),
                Err(err) => warn!(error = %err, "change journal poll failed"),
            }

            ticks += 1;
            if ticks % PRUNE_EVERY_TICKS == 0 {
                let before = Utc::now() - chrono::Duration::minutes(JOURNAL_RETENTION_MINUTES);
                if let Err(err) = storage.prune_journal(before).await {
                    warn!(error = %err, "change journal prune failed");
                }
            }
        }
    }))
}

/// Publishes every foreign journal entry after `cursor` and advances it.
pub(crate) async fn forward_foreign_writes(
    storage: &Storage,
    events: &broadcast::Sender<ServerEvent>,
    cursor: &mut i64,
) -> anyhow::Result<usize> {
    let mut forwarded = 0;
    loop {
        let records = storage.foreign_journal_since(*cursor, JOURNAL_BATCH).await?;
        let fetched = records.len();
        for record in records {
            *cursor = record.seq;
            match record.event {
                Some(event) => {
                    let _ = events.send(event);
                    forwarded += 1;
                }
                None => warn!(seq = record.seq, "skipping undecodable journal entry"),
            }
        }
        if fetched < JOURNAL_BATCH as usize {
            return Ok(forwarded);
        }
    }
}

#[cfg(test)]
#[path = "tests/journal_tail_tests.rs"]
mod tests;
