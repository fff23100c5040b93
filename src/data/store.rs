use std::collections::HashMap;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// Aggregated OHLCV record for one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub ticker: String,
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMetadata {
    pub ticker: String,
    pub name: String,
    pub current_price: f64,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChartInterval {
    #[default]
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "10m")]
    TenMinutes,
}

impl ChartInterval {
    pub fn minutes(&self) -> u32 {
        match self {
            ChartInterval::OneMinute => 1,
            ChartInterval::FiveMinutes => 5,
            ChartInterval::TenMinutes => 10,
        }
    }

    /// Parse an optional client value, falling back to the finest interval
    /// when it is absent or unrecognised.
    pub fn or_default(value: Option<&str>) -> Self {
        value.and_then(|v| v.parse().ok()).unwrap_or_default()
    }

    fn bucket_start(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let minute = ts.minute() - ts.minute() % self.minutes();
        ts.with_minute(minute)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(ts)
    }
}

impl FromStr for ChartInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" | "ONE_MINUTE" => Ok(ChartInterval::OneMinute),
            "5m" | "FIVE_MINUTES" => Ok(ChartInterval::FiveMinutes),
            "10m" | "TEN_MINUTES" => Ok(ChartInterval::TenMinutes),
            other => Err(format!("Invalid interval value: {}", other)),
        }
    }
}

/// Read side of the historical bar store.
pub trait HistoricalBarStore: Send + Sync {
    /// Bars for `ticker` within `[from, to]`, ordered by timestamp.
    fn query(
        &self,
        ticker: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
        interval: ChartInterval,
    ) -> Result<Vec<Bar>, StoreError>;
}

pub trait StockMetadataLookup: Send + Sync {
    fn by_ticker(&self, ticker: &str) -> Result<StockMetadata, StoreError>;
}

/// Bar store holding one-minute bars per ticker in memory.
#[derive(Debug, Default)]
pub struct InMemoryBarStore {
    bars: HashMap<String, Vec<Bar>>,
}

impl InMemoryBarStore {
    pub fn new(mut bars: HashMap<String, Vec<Bar>>) -> Self {
        for series in bars.values_mut() {
            series.sort_by_key(|bar| bar.timestamp);
        }
        Self { bars }
    }

    pub fn ticker_count(&self) -> usize {
        self.bars.len()
    }

    pub fn total_bars(&self) -> usize {
        self.bars.values().map(|series| series.len()).sum()
    }
}

impl HistoricalBarStore for InMemoryBarStore {
    fn query(
        &self,
        ticker: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
        interval: ChartInterval,
    ) -> Result<Vec<Bar>, StoreError> {
        let in_range = self
            .bars
            .get(ticker)
            .map(|series| {
                series
                    .iter()
                    .filter(|bar| bar.timestamp >= from && bar.timestamp <= to)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(aggregate(in_range, interval))
    }
}

/// Fold ordered one-minute bars into `interval` buckets.
pub fn aggregate(bars: Vec<Bar>, interval: ChartInterval) -> Vec<Bar> {
    if interval == ChartInterval::OneMinute {
        return bars;
    }

    let mut out: Vec<Bar> = Vec::new();
    for bar in bars {
        let bucket = interval.bucket_start(bar.timestamp);
        match out.last_mut() {
            Some(current) if current.timestamp == bucket => {
                current.high = current.high.max(bar.high);
                current.low = current.low.min(bar.low);
                current.close = bar.close;
                current.volume += bar.volume;
            }
            _ => out.push(Bar { timestamp: bucket, ..bar }),
        }
    }
    out
}

/// Trailing window ending now, in local exchange time. A window reaching
/// past the representable range starts at `NaiveDateTime::MIN`.
pub fn trailing_window(length: Duration) -> (NaiveDateTime, NaiveDateTime) {
    let to = chrono::Local::now().naive_local();
    let from = to.checked_sub_signed(length).unwrap_or(NaiveDateTime::MIN);
    (from, to)
}

#[derive(Debug, Default)]
pub struct InMemoryStockDirectory {
    stocks: HashMap<String, StockMetadata>,
}

impl InMemoryStockDirectory {
    pub fn new(stocks: Vec<StockMetadata>) -> Self {
        Self {
            stocks: stocks.into_iter().map(|s| (s.ticker.clone(), s)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stocks.len()
    }
}

impl StockMetadataLookup for InMemoryStockDirectory {
    fn by_ticker(&self, ticker: &str) -> Result<StockMetadata, StoreError> {
        self.stocks
            .get(ticker)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(ticker.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    pub(crate) fn bar(ticker: &str, ts: NaiveDateTime, open: f64, close: f64, volume: u64) -> Bar {
        Bar {
            ticker: ticker.to_string(),
            timestamp: ts,
            open,
            high: open.max(close) + 1.0,
            low: open.min(close) - 1.0,
            close,
            volume,
        }
    }

    fn store() -> InMemoryBarStore {
        let series = (0..12)
            .map(|i| bar("005930", at(9, i), 100.0 + i as f64, 101.0 + i as f64, 10))
            .rev()
            .collect();
        let mut map = HashMap::new();
        map.insert("005930".to_string(), series);
        InMemoryBarStore::new(map)
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!("5m".parse::<ChartInterval>(), Ok(ChartInterval::FiveMinutes));
        assert_eq!("TEN_MINUTES".parse::<ChartInterval>(), Ok(ChartInterval::TenMinutes));
        assert!("3h".parse::<ChartInterval>().is_err());
    }

    #[test]
    fn test_interval_falls_back_to_finest() {
        assert_eq!(ChartInterval::or_default(Some("weekly")), ChartInterval::OneMinute);
        assert_eq!(ChartInterval::or_default(None), ChartInterval::OneMinute);
        assert_eq!(ChartInterval::or_default(Some("10m")), ChartInterval::TenMinutes);
    }

    #[test]
    fn test_query_filters_range_and_orders() {
        let bars = store()
            .query("005930", at(9, 2), at(9, 4), ChartInterval::OneMinute)
            .unwrap();
        let minutes: Vec<u32> = bars.iter().map(|b| b.timestamp.minute()).collect();
        assert_eq!(minutes, vec![2, 3, 4]);
    }

    #[test]
    fn test_query_unknown_ticker_is_empty() {
        let bars = store()
            .query("000660", at(9, 0), at(10, 0), ChartInterval::OneMinute)
            .unwrap();
        assert!(bars.is_empty());
    }

    #[test]
    fn test_query_aggregates_five_minute_buckets() {
        let bars = store()
            .query("005930", at(9, 0), at(9, 11), ChartInterval::FiveMinutes)
            .unwrap();

        assert_eq!(bars.len(), 3);
        let first = &bars[0];
        assert_eq!(first.timestamp, at(9, 0));
        assert_eq!(first.open, 100.0);
        assert_eq!(first.close, 105.0);
        assert_eq!(first.high, 106.0);
        assert_eq!(first.low, 99.0);
        assert_eq!(first.volume, 50);
        assert_eq!(bars[2].timestamp, at(9, 10));
        assert_eq!(bars[2].volume, 20);
    }

    #[test]
    fn test_trailing_window_saturates() {
        let (from, to) = trailing_window(Duration::try_days(100_000_000).unwrap());
        assert_eq!(from, NaiveDateTime::MIN);
        assert!(to > from);

        let (from, to) = trailing_window(Duration::minutes(10));
        assert_eq!(to - from, Duration::minutes(10));
    }

    #[test]
    fn test_stock_directory_lookup() {
        let directory = InMemoryStockDirectory::new(vec![StockMetadata {
            ticker: "005930".to_string(),
            name: "Samsung Electronics".to_string(),
            current_price: 71900.0,
            per: Some(13.2),
            pbr: Some(1.4),
        }]);

        assert_eq!(directory.by_ticker("005930").unwrap().name, "Samsung Electronics");
        assert_eq!(
            directory.by_ticker("999999"),
            Err(StoreError::NotFound("999999".to_string()))
        );
    }
}
