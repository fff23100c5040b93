use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ParseError;

// Response types
pub const STOCK_DATA: &str = "STOCK_DATA";
pub const CHART_DATA: &str = "CHART_DATA";
pub const SUBSCRIPTION_CONFIRMED: &str = "SUBSCRIPTION_CONFIRMED";
pub const UNSUBSCRIPTION_CONFIRMED: &str = "UNSUBSCRIPTION_CONFIRMED";
pub const PONG: &str = "PONG";
pub const ERROR: &str = "ERROR";
pub const CONNECTION_ESTABLISHED: &str = "CONNECTION_ESTABLISHED";
pub const REALTIME_TICK: &str = "REALTIME_TICK";
pub const CHART_UPDATE: &str = "CHART_UPDATE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestType {
    GetStockData,
    GetChartData,
    Subscribe,
    Unsubscribe,
    Ping,
    /// Anything else. Decodes fine, rejected by the router.
    Unknown(String),
}

impl RequestType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "GET_STOCK_DATA" => RequestType::GetStockData,
            "GET_CHART_DATA" => RequestType::GetChartData,
            "SUBSCRIBE_TO_TICKER" => RequestType::Subscribe,
            "UNSUBSCRIBE_FROM_TICKER" => RequestType::Unsubscribe,
            "PING" => RequestType::Ping,
            other => RequestType::Unknown(other.to_string()),
        }
    }

    pub fn as_tag(&self) -> &str {
        match self {
            RequestType::GetStockData => "GET_STOCK_DATA",
            RequestType::GetChartData => "GET_CHART_DATA",
            RequestType::Subscribe => "SUBSCRIBE_TO_TICKER",
            RequestType::Unsubscribe => "UNSUBSCRIBE_FROM_TICKER",
            RequestType::Ping => "PING",
            RequestType::Unknown(tag) => tag,
        }
    }
}

/// Payload shared by every ticker-oriented request.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct TickerPayload {
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub request_type: RequestType,
    /// Caller-supplied correlation token, echoed back untouched.
    pub request_id: Option<Value>,
    pub payload: Value,
}

impl RequestEnvelope {
    /// Interpret the raw payload as a [`TickerPayload`]. A missing or null
    /// payload yields the empty payload.
    pub fn ticker_payload(&self) -> Result<TickerPayload, serde_json::Error> {
        if self.payload.is_null() {
            return Ok(TickerPayload::default());
        }
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    request_id: Option<Value>,
    #[serde(default)]
    payload: Value,
}

pub fn decode_request(raw: &str) -> Result<RequestEnvelope, ParseError> {
    let wire: WireRequest =
        serde_json::from_str(raw).map_err(|e| ParseError::InvalidEnvelope(e.to_string()))?;

    Ok(RequestEnvelope {
        request_type: RequestType::from_tag(wire.kind.as_deref().unwrap_or_default()),
        request_id: wire.request_id.filter(|id| !id.is_null()),
        payload: wire.payload,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub response_type: String,
    pub request_id: Option<Value>,
    pub status: ResponseStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Emission time, epoch millis.
    pub timestamp: i64,
}

impl ResponseEnvelope {
    pub fn success(response_type: &str, request_id: Option<Value>, data: Value) -> Self {
        Self {
            response_type: response_type.to_string(),
            request_id,
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn error(response_type: &str, request_id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            response_type: response_type.to_string(),
            request_id,
            status: ResponseStatus::Error,
            data: None,
            error: Some(message.into()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn pong(request_id: Option<Value>) -> Self {
        Self {
            response_type: PONG.to_string(),
            request_id,
            status: ResponseStatus::Success,
            data: None,
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub fn encode_response(response: &ResponseEnvelope) -> String {
    match serde_json::to_string(response) {
        Ok(json) => json,
        Err(e) => {
            log::error!("Failed to serialize {} response: {}", response.response_type, e);
            serde_json::json!({
                "type": ERROR,
                "requestId": response.request_id,
                "status": ResponseStatus::Error,
                "data": null,
                "error": format!("Failed to serialize response: {}", e),
                "timestamp": response.timestamp,
            })
            .to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_known_request() {
        let request = decode_request(
            r#"{"type":"GET_CHART_DATA","requestId":"r7","payload":{"ticker":"005930","interval":"5m","limit":20}}"#,
        )
        .unwrap();

        assert_eq!(request.request_type, RequestType::GetChartData);
        assert_eq!(request.request_id, Some(json!("r7")));

        let payload = request.ticker_payload().unwrap();
        assert_eq!(payload.ticker.as_deref(), Some("005930"));
        assert_eq!(payload.interval.as_deref(), Some("5m"));
        assert_eq!(payload.limit, Some(20));
    }

    #[test]
    fn test_decode_unknown_type_succeeds() {
        let request = decode_request(r#"{"type":"BOGUS"}"#).unwrap();
        assert_eq!(request.request_type, RequestType::Unknown("BOGUS".to_string()));
        assert_eq!(request.request_id, None);
        assert!(request.payload.is_null());
    }

    #[test]
    fn test_decode_null_request_id_is_absent() {
        let request = decode_request(r#"{"type":"PING","requestId":null}"#).unwrap();
        assert_eq!(request.request_id, None);
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(matches!(
            decode_request("subscribe 005930"),
            Err(ParseError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_request_type_tags() {
        for tag in ["GET_STOCK_DATA", "GET_CHART_DATA", "SUBSCRIBE_TO_TICKER", "UNSUBSCRIBE_FROM_TICKER", "PING"] {
            assert_eq!(RequestType::from_tag(tag).as_tag(), tag);
        }
    }

    #[test]
    fn test_encode_pong() {
        let encoded = encode_response(&ResponseEnvelope::pong(Some(json!("r1"))));
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "PONG");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["status"], "SUCCESS");
        assert!(value["data"].is_null());
        assert!(value["error"].is_null());
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_encode_error() {
        let response = ResponseEnvelope::error(ERROR, None, "Ticker is required");
        let value: Value = serde_json::from_str(&encode_response(&response)).unwrap();

        assert_eq!(value["status"], "ERROR");
        assert_eq!(value["error"], "Ticker is required");
        assert!(value["requestId"].is_null());
        assert!(value["data"].is_null());
    }
}
