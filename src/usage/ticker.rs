use crate::storage::UsageStore;
use crate::usage::ledger::UsageLedger;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// Background task that closes accounting weeks on a timer, so a week ends
/// even when no request arrives after its boundary.
pub struct RolloverTicker {
    task: JoinHandle<()>,
    stop_tx: oneshot::Sender<()>,
}

impl RolloverTicker {
    pub fn spawn(ledger: Arc<UsageLedger>, store: Arc<dyn UsageStore>, every: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticks = interval(every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let Some(record) = ledger.roll_over(Utc::now()) else {
                            debug!("Rollover check: week still open");
                            continue;
                        };
                        if let Err(e) = store.append(&record).await {
                            error!(error = %e, week_start = %record.start_date, "Failed to persist weekly usage record");
                        }
                    }
                    _ = &mut stop_rx => {
                        info!("Rollover ticker stopping");
                        break;
                    }
                }
            }
        });

        Self { task, stop_tx }
    }

    /// Signal the task and wait for any in-flight write to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryUsageStore;
    use crate::usage::ledger::{UsageTotals, week_start};

    #[tokio::test]
    async fn test_ticker_persists_overdue_week() {
        let last_week = week_start(Utc::now().date_naive()) - chrono::Duration::days(7);
        let ledger = Arc::new(UsageLedger::with_totals(
            UsageTotals {
                input_tokens: 40,
                output_tokens: 2,
                week_start: last_week,
            },
            1.0,
        ));
        let store = Arc::new(MemoryUsageStore::new());

        let ticker = RolloverTicker::spawn(ledger.clone(), store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        ticker.stop().await;

        let records = store.list_desc().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].start_date, last_week);
        assert_eq!(records[0].total_tokens, 42);
        assert_eq!(ledger.snapshot().total_tokens(), 0);
    }

    #[tokio::test]
    async fn test_ticker_leaves_open_week_alone() {
        let ledger = Arc::new(UsageLedger::new(1.0, Utc::now()));
        ledger.record_exchange(3, 3, Utc::now());
        let store = Arc::new(MemoryUsageStore::new());

        let ticker = RolloverTicker::spawn(ledger.clone(), store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        ticker.stop().await;

        assert!(store.list_desc().await.unwrap().is_empty());
        assert_eq!(ledger.snapshot().total_tokens(), 6);
    }
}
