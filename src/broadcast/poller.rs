use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::hub::BroadcastHub;
use crate::data::{trailing_window, ChartInterval, HistoricalBarStore};
use crate::errors::StoreError;

/// Periodically pushes the default ticker's recent bars to every session,
/// whether or not the upstream feed is connected.
pub struct ChartPoller {
    bars: Arc<dyn HistoricalBarStore>,
    hub: BroadcastHub,
    ticker: String,
    period: Duration,
    window: chrono::Duration,
    interval: ChartInterval,
}

impl ChartPoller {
    pub fn new(
        bars: Arc<dyn HistoricalBarStore>,
        hub: BroadcastHub,
        ticker: String,
        period: Duration,
        window: chrono::Duration,
    ) -> Self {
        Self {
            bars,
            hub,
            ticker,
            period,
            window,
            interval: ChartInterval::OneMinute,
        }
    }

    /// Query the trailing window once and broadcast it, empty or not.
    pub fn poll_once(&self) -> Result<usize, StoreError> {
        let (from, to) = trailing_window(self.window);
        let bars = self.bars.query(&self.ticker, from, to, self.interval)?;
        let delivered = self.hub.publish_chart(&bars);
        debug!(
            "Chart update for {} ({} bars) delivered to {} sessions",
            self.ticker,
            bars.len(),
            delivered
        );
        Ok(delivered)
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(self.period);
            info!(
                "Chart poller started for {} every {:?} ({} window)",
                self.ticker,
                self.period,
                self.window
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Chart poller stopped");
                        break;
                    }
                    _ = interval_timer.tick() => {
                        if let Err(e) = self.poll_once() {
                            warn!("Chart poll for {} failed: {}", self.ticker, e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Bar, InMemoryBarStore};
    use crate::session::{SessionHandle, SessionRegistry};
    use serde_json::Value;
    use std::collections::HashMap;

    struct FailingStore;

    impl HistoricalBarStore for FailingStore {
        fn query(
            &self,
            ticker: &str,
            _from: chrono::NaiveDateTime,
            _to: chrono::NaiveDateTime,
            _interval: ChartInterval,
        ) -> Result<Vec<Bar>, StoreError> {
            Err(StoreError::NotFound(ticker.to_string()))
        }
    }

    fn store_with_recent_bars() -> InMemoryBarStore {
        let now = chrono::Local::now().naive_local();
        let series = (1..=20)
            .map(|m| Bar {
                ticker: "005930".to_string(),
                timestamp: now - chrono::Duration::minutes(m),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 1,
            })
            .collect();
        let mut map = HashMap::new();
        map.insert("005930".to_string(), series);
        InMemoryBarStore::new(map)
    }

    #[test]
    fn test_poll_once_sends_trailing_window() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = SessionHandle::new("peer");
        registry.add(handle);

        let poller = ChartPoller::new(
            Arc::new(store_with_recent_bars()),
            BroadcastHub::new(registry),
            "005930".to_string(),
            Duration::from_secs(5),
            chrono::Duration::minutes(10),
        );

        assert_eq!(poller.poll_once(), Ok(1));
        let value: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["type"], "CHART_UPDATE");
        // minutes 1..=9 are inside a ten minute window; minute 10 sits on the edge
        let len = value["data"].as_array().unwrap().len();
        assert!((9..=10).contains(&len), "unexpected bar count {}", len);
    }

    #[test]
    fn test_poll_once_reports_store_errors() {
        let poller = ChartPoller::new(
            Arc::new(FailingStore),
            BroadcastHub::new(SessionRegistry::new()),
            "005930".to_string(),
            Duration::from_secs(5),
            chrono::Duration::minutes(10),
        );
        assert!(matches!(poller.poll_once(), Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_spawned_poller_ticks_until_cancelled() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = SessionHandle::new("peer");
        registry.add(handle);

        let poller = ChartPoller::new(
            Arc::new(InMemoryBarStore::default()),
            BroadcastHub::new(registry),
            "005930".to_string(),
            Duration::from_millis(20),
            chrono::Duration::minutes(10),
        );
        let cancel = CancellationToken::new();
        let task = poller.spawn(cancel.clone());

        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(message.contains("CHART_UPDATE"));
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
