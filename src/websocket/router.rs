use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::codec::envelope::{
    CHART_DATA, ERROR, STOCK_DATA, SUBSCRIPTION_CONFIRMED, UNSUBSCRIPTION_CONFIRMED,
};
use crate::codec::{decode_request, RequestEnvelope, RequestType, ResponseEnvelope, TickerPayload};
use crate::data::{trailing_window, ChartInterval, HistoricalBarStore, StockMetadataLookup};
use crate::errors::RouterError;
use crate::session::SessionRegistry;

/// GET_CHART_DATA always covers the last day.
const CHART_WINDOW_HOURS: i64 = 24;

/// Turns one downstream request into exactly one response. Never fails:
/// every error becomes an ERROR envelope for the requesting session.
#[derive(Clone)]
pub struct RequestRouter {
    stocks: Arc<dyn StockMetadataLookup>,
    bars: Arc<dyn HistoricalBarStore>,
    registry: SessionRegistry,
}

impl RequestRouter {
    pub fn new(
        stocks: Arc<dyn StockMetadataLookup>,
        bars: Arc<dyn HistoricalBarStore>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            stocks,
            bars,
            registry,
        }
    }

    /// Decode and route a raw text frame.
    pub fn handle_text(&self, session_id: Uuid, raw: &str) -> ResponseEnvelope {
        match decode_request(raw) {
            Ok(request) => self.route(session_id, request),
            Err(e) => {
                warn!("Session {} sent an undecodable request: {}", session_id, e);
                ResponseEnvelope::error(ERROR, None, format!("Failed to process request: {}", e))
            }
        }
    }

    pub fn route(&self, session_id: Uuid, request: RequestEnvelope) -> ResponseEnvelope {
        debug!(
            "Session {} request {} (id {:?})",
            session_id,
            request.request_type.as_tag(),
            request.request_id
        );

        let request_id = request.request_id.clone();
        let result = match &request.request_type {
            RequestType::GetStockData => self.stock_data(&request),
            RequestType::GetChartData => self.chart_data(&request),
            RequestType::Subscribe => self.subscribe(session_id, &request),
            RequestType::Unsubscribe => self.unsubscribe(session_id, &request),
            RequestType::Ping => Ok(ResponseEnvelope::pong(request_id.clone())),
            RequestType::Unknown(tag) => Err(RouterError::UnknownRequestType(tag.clone())),
        };

        result.unwrap_or_else(|e| {
            warn!("Request {} from session {} failed: {}", request.request_type.as_tag(), session_id, e);
            ResponseEnvelope::error(ERROR, request_id, e.to_string())
        })
    }

    fn stock_data(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, RouterError> {
        let (ticker, _) = require_ticker(request, "Ticker is required")?;

        let stock = self
            .stocks
            .by_ticker(&ticker)
            .map_err(|e| with_context(RouterError::from(e), "Failed to get stock data"))?;

        Ok(ResponseEnvelope::success(
            STOCK_DATA,
            request.request_id.clone(),
            to_data(&stock)?,
        ))
    }

    fn chart_data(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, RouterError> {
        let (ticker, payload) = require_ticker(request, "Ticker is required")?;
        let interval = ChartInterval::or_default(payload.interval.as_deref());
        let (from, to) = trailing_window(chrono::Duration::hours(CHART_WINDOW_HOURS));

        let mut bars = self
            .bars
            .query(&ticker, from, to, interval)
            .map_err(|e| with_context(RouterError::from(e), "Failed to get chart data"))?;

        if let Some(limit) = payload.limit {
            if bars.len() > limit {
                bars.drain(..bars.len() - limit);
            }
        }

        Ok(ResponseEnvelope::success(
            CHART_DATA,
            request.request_id.clone(),
            to_data(&bars)?,
        ))
    }

    fn subscribe(&self, session_id: Uuid, request: &RequestEnvelope) -> Result<ResponseEnvelope, RouterError> {
        let (ticker, _) = require_ticker(request, "Ticker is required for subscription")?;

        if !self.registry.note_subscription(session_id, &ticker) {
            debug!("Session {} is not registered; subscription to {} not recorded", session_id, ticker);
        }

        Ok(ResponseEnvelope::success(
            SUBSCRIPTION_CONFIRMED,
            request.request_id.clone(),
            Value::String(format!("Successfully subscribed to {}", ticker)),
        ))
    }

    fn unsubscribe(&self, session_id: Uuid, request: &RequestEnvelope) -> Result<ResponseEnvelope, RouterError> {
        let (ticker, _) = require_ticker(request, "Ticker is required for unsubscription")?;

        self.registry.note_unsubscription(session_id, &ticker);

        Ok(ResponseEnvelope::success(
            UNSUBSCRIPTION_CONFIRMED,
            request.request_id.clone(),
            Value::String(format!("Successfully unsubscribed from {}", ticker)),
        ))
    }
}

fn require_ticker(
    request: &RequestEnvelope,
    missing: &'static str,
) -> Result<(String, TickerPayload), RouterError> {
    let payload = request
        .ticker_payload()
        .map_err(|e| RouterError::InvalidPayload(e.to_string()))?;

    let ticker = payload
        .ticker
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(RouterError::MissingField(missing))?
        .to_string();

    Ok((ticker, payload))
}

fn with_context(err: RouterError, context: &str) -> RouterError {
    match err {
        RouterError::NotFound(msg) => RouterError::NotFound(format!("{}: {}", context, msg)),
        RouterError::Store(msg) => RouterError::Store(format!("{}: {}", context, msg)),
        other => other,
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, RouterError> {
    serde_json::to_value(value).map_err(|e| RouterError::Store(format!("Failed to serialize data: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::envelope::ResponseStatus;
    use crate::data::store::StockMetadata;
    use crate::data::{Bar, InMemoryBarStore, InMemoryStockDirectory};
    use crate::session::SessionHandle;
    use std::collections::HashMap;

    fn recent_bars(count: i64) -> Vec<Bar> {
        let now = chrono::Local::now().naive_local();
        (0..count)
            .map(|i| Bar {
                ticker: "005930".to_string(),
                timestamp: now - chrono::Duration::minutes(count - i),
                open: 71000.0 + i as f64,
                high: 71100.0 + i as f64,
                low: 70900.0 + i as f64,
                close: 71050.0 + i as f64,
                volume: 100,
            })
            .collect()
    }

    fn router() -> (RequestRouter, SessionRegistry) {
        let stocks = InMemoryStockDirectory::new(vec![StockMetadata {
            ticker: "005930".to_string(),
            name: "Samsung Electronics".to_string(),
            current_price: 71900.0,
            per: Some(13.2),
            pbr: Some(1.4),
        }]);
        let mut series = HashMap::new();
        series.insert("005930".to_string(), recent_bars(30));

        let registry = SessionRegistry::new();
        let router = RequestRouter::new(
            Arc::new(stocks),
            Arc::new(InMemoryBarStore::new(series)),
            registry.clone(),
        );
        (router, registry)
    }

    #[test]
    fn test_ping_echoes_request_id() {
        let (router, _) = router();
        let response = router.handle_text(Uuid::new_v4(), r#"{"type":"PING","requestId":"r1"}"#);

        assert_eq!(response.response_type, "PONG");
        assert_eq!(response.request_id, Some(Value::String("r1".to_string())));
        assert_eq!(response.status, ResponseStatus::Success);
    }

    #[test]
    fn test_stock_data_requires_ticker() {
        let (router, _) = router();
        let response = router.handle_text(
            Uuid::new_v4(),
            r#"{"type":"GET_STOCK_DATA","requestId":"r2","payload":{"ticker":"  "}}"#,
        );

        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.response_type, ERROR);
        assert_eq!(response.error.as_deref(), Some("Ticker is required"));
        assert_eq!(response.request_id, Some(Value::String("r2".to_string())));
    }

    #[test]
    fn test_stock_data_lookup() {
        let (router, _) = router();
        let response = router.handle_text(
            Uuid::new_v4(),
            r#"{"type":"GET_STOCK_DATA","payload":{"ticker":" 005930 "}}"#,
        );

        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.response_type, STOCK_DATA);
        assert_eq!(response.request_id, None);
        let data = response.data.unwrap();
        assert_eq!(data["name"], "Samsung Electronics");
        assert_eq!(data["currentPrice"], 71900.0);
    }

    #[test]
    fn test_stock_data_not_found() {
        let (router, _) = router();
        let response = router.handle_text(
            Uuid::new_v4(),
            r#"{"type":"GET_STOCK_DATA","requestId":"r3","payload":{"ticker":"999999"}}"#,
        );

        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(
            response.error.as_deref(),
            Some("Failed to get stock data: Stock not found with ticker: 999999")
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let (router, _) = router();
        let response = router.handle_text(Uuid::new_v4(), r#"{"type":"BOGUS"}"#);

        assert_eq!(response.response_type, ERROR);
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error.as_deref(), Some("Unknown request type: BOGUS"));
    }

    #[test]
    fn test_undecodable_frame_gets_error_envelope() {
        let (router, _) = router();
        let response = router.handle_text(Uuid::new_v4(), "not json");

        assert_eq!(response.response_type, ERROR);
        assert_eq!(response.request_id, None);
        assert!(response.error.unwrap().starts_with("Failed to process request:"));
    }

    #[test]
    fn test_chart_data_applies_limit_and_falls_back_on_interval() {
        let (router, _) = router();
        let response = router.handle_text(
            Uuid::new_v4(),
            r#"{"type":"GET_CHART_DATA","requestId":"c1","payload":{"ticker":"005930","interval":"weekly","limit":5}}"#,
        );

        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.response_type, CHART_DATA);
        let bars = response.data.unwrap();
        let bars = bars.as_array().unwrap();
        assert_eq!(bars.len(), 5);
        assert_eq!(bars[4]["close"], 71050.0 + 29.0);
    }

    #[test]
    fn test_chart_data_without_limit_returns_window() {
        let (router, _) = router();
        let response = router.handle_text(
            Uuid::new_v4(),
            r#"{"type":"GET_CHART_DATA","payload":{"ticker":"005930"}}"#,
        );

        assert_eq!(response.data.unwrap().as_array().unwrap().len(), 30);
    }

    #[test]
    fn test_chart_data_unknown_ticker_is_empty() {
        let (router, _) = router();
        let response = router.handle_text(
            Uuid::new_v4(),
            r#"{"type":"GET_CHART_DATA","payload":{"ticker":"000660","interval":"5m"}}"#,
        );

        assert_eq!(response.status, ResponseStatus::Success);
        assert!(response.data.unwrap().as_array().unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_twice_confirms_twice() {
        let (router, registry) = router();
        let (handle, _rx) = SessionHandle::new("127.0.0.1:5000");
        let id = handle.id();
        registry.add(handle);

        let raw = r#"{"type":"SUBSCRIBE_TO_TICKER","requestId":"s1","payload":{"ticker":"005930"}}"#;
        for _ in 0..2 {
            let response = router.handle_text(id, raw);
            assert_eq!(response.status, ResponseStatus::Success);
            assert_eq!(response.response_type, SUBSCRIPTION_CONFIRMED);
            assert_eq!(response.data, Some(Value::String("Successfully subscribed to 005930".to_string())));
        }
        assert_eq!(registry.subscriptions(id).len(), 1);

        let response = router.handle_text(
            id,
            r#"{"type":"UNSUBSCRIBE_FROM_TICKER","payload":{"ticker":"005930"}}"#,
        );
        assert_eq!(response.response_type, UNSUBSCRIPTION_CONFIRMED);
        assert!(registry.subscriptions(id).is_empty());
    }

    #[test]
    fn test_subscribe_requires_ticker() {
        let (router, _) = router();
        let response = router.handle_text(Uuid::new_v4(), r#"{"type":"SUBSCRIBE_TO_TICKER","payload":{}}"#);
        assert_eq!(response.error.as_deref(), Some("Ticker is required for subscription"));

        let response = router.handle_text(Uuid::new_v4(), r#"{"type":"UNSUBSCRIBE_FROM_TICKER"}"#);
        assert_eq!(response.error.as_deref(), Some("Ticker is required for unsubscription"));
    }
}
