use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::ParseError;

// Upstream subscription constants
pub const TRANSACTION_ID: &str = "H0STCNT0";
pub const CUSTOMER_TYPE: &str = "P";
pub const TRANSACTION_TYPE_REGISTER: &str = "1";
pub const CONTENT_TYPE: &str = "utf-8";

// Frame layout
pub const MIN_SEGMENTS: usize = 3;
pub const MIN_FIELDS: usize = 32;
const DATA_SEGMENT: usize = 2;

const IDX_TICKER: usize = 0;
const IDX_TRADE_TIME: usize = 1;
const IDX_CURRENT_PRICE: usize = 2;
const IDX_OPEN: usize = 7;
const IDX_HIGH: usize = 8;
const IDX_LOW: usize = 9;
const IDX_VOLUME: usize = 12;
const IDX_CUMULATIVE_VALUE: usize = 14;
const IDX_BUSINESS_DATE: usize = 31;

/// One normalized quote update decoded from a single upstream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealTimeTick {
    pub ticker: String,
    /// Exchange time, HHMMSS.
    pub trade_time: String,
    pub current_price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: u64,
    pub cumulative_value: u64,
    pub business_date: String,
}

/// Decode a `header|headerCount|data` frame whose data segment is a
/// `^`-joined field list. Either every field parses or nothing is returned.
pub fn decode_tick(raw: &str) -> Result<RealTimeTick, ParseError> {
    let segments: Vec<&str> = raw.split('|').collect();
    if segments.len() < MIN_SEGMENTS {
        return Err(ParseError::MalformedFrame(segments.len()));
    }

    let fields: Vec<&str> = segments[DATA_SEGMENT].split('^').collect();
    if fields.len() < MIN_FIELDS {
        return Err(ParseError::InsufficientFields(fields.len()));
    }

    Ok(RealTimeTick {
        ticker: fields[IDX_TICKER].to_string(),
        trade_time: fields[IDX_TRADE_TIME].to_string(),
        current_price: parse_field(fields[IDX_CURRENT_PRICE], "currentPrice")?,
        open: parse_field(fields[IDX_OPEN], "open")?,
        high: parse_field(fields[IDX_HIGH], "high")?,
        low: parse_field(fields[IDX_LOW], "low")?,
        volume: parse_field(fields[IDX_VOLUME], "volume")?,
        cumulative_value: parse_field(fields[IDX_CUMULATIVE_VALUE], "cumulativeValue")?,
        business_date: fields[IDX_BUSINESS_DATE].to_string(),
    })
}

fn parse_field<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::NumericParseError {
        field,
        value: value.to_string(),
    })
}

/// Provider control messages (subscription acks, keep-alives) arrive as
/// JSON objects rather than `|`-delimited data frames.
pub fn is_control_frame(raw: &str) -> bool {
    raw.trim_start().starts_with('{')
}

/// Build the one-time subscription request sent when the upstream
/// connection opens.
pub fn encode_subscription(approval_key: &str, ticker: &str) -> String {
    json!({
        "header": {
            "approval_key": approval_key,
            "custtype": CUSTOMER_TYPE,
            "tr_type": TRANSACTION_TYPE_REGISTER,
            "content-type": CONTENT_TYPE,
        },
        "body": {
            "input": {
                "tr_id": TRANSACTION_ID,
                "tr_key": ticker,
            }
        }
    })
    .to_string()
}
