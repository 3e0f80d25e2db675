//! Kline decoding for the stream and REST paths.
//!
//! Stream messages arrive either raw (`/ws`) or wrapped by the combined
//! endpoint (`{"stream": ..., "data": ...}`); both are accepted. Only events
//! whose kline carries `x == true` become candles.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::candle::Candle;
use crate::errors::DecodeError;
use crate::timeframe::Timeframe;

/// One REST kline row: a fixed-position JSON array.
pub type RawKline = Vec<Value>;

/// Outcome of decoding one stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A closed kline, ready to persist.
    Closed(Candle),
    /// A kline update for a still-open bucket; never persisted.
    Open { symbol: String, timeframe: Timeframe },
    /// Response to a SUBSCRIBE/UNSUBSCRIBE request.
    Ack { id: u64, error: Option<String> },
    /// Anything else the stream may send.
    Ignored,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: StreamKline,
}

#[derive(Debug, Deserialize)]
struct StreamKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "f")]
    first_trade_id: Option<i64>,
    #[serde(rename = "L")]
    last_trade_id: Option<i64>,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "n")]
    number_of_trades: i64,
    #[serde(rename = "x")]
    is_closed: bool,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "V")]
    taker_buy_base_volume: String,
    #[serde(rename = "Q")]
    taker_buy_quote_volume: String,
}

/// Decode one text frame from the kline stream.
pub fn decode_stream_message(text: &str) -> Result<StreamEvent, DecodeError> {
    let mut value: Value = serde_json::from_str(text)?;

    // Combined stream wrapper
    if let Some(data) = value.get_mut("data") {
        value = data.take();
    }

    if value.get("e").and_then(Value::as_str) == Some("kline") {
        let event: KlineEvent = serde_json::from_value(value)?;
        return decode_kline_event(event);
    }

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let error = value.get("error").map(|e| e.to_string());
        return Ok(StreamEvent::Ack { id, error });
    }

    Ok(StreamEvent::Ignored)
}

fn decode_kline_event(event: KlineEvent) -> Result<StreamEvent, DecodeError> {
    let k = event.kline;
    let timeframe = Timeframe::from_str(&k.interval)?;

    if !k.is_closed {
        return Ok(StreamEvent::Open {
            symbol: event.symbol,
            timeframe,
        });
    }

    let candle = Candle {
        symbol: event.symbol,
        timeframe,
        open_time: k.open_time,
        close_time: k.close_time,
        open: parse_decimal("o", &k.open)?,
        high: parse_decimal("h", &k.high)?,
        low: parse_decimal("l", &k.low)?,
        close: parse_decimal("c", &k.close)?,
        base_volume: parse_decimal("v", &k.volume)?,
        quote_volume: parse_decimal("q", &k.quote_volume)?,
        taker_buy_base_volume: parse_decimal("V", &k.taker_buy_base_volume)?,
        taker_buy_quote_volume: parse_decimal("Q", &k.taker_buy_quote_volume)?,
        trade_count: k.number_of_trades,
        is_closed: true,
        event_time: Some(event.event_time),
        first_trade_id: k.first_trade_id,
        last_trade_id: k.last_trade_id,
        open_interest: None,
        funding_rate: None,
    };
    candle.validate()?;

    Ok(StreamEvent::Closed(candle))
}

/// Decode one REST row:
/// `[open_time, open, high, low, close, volume, close_time, quote_volume,
///   trade_count, taker_buy_base, taker_buy_quote, ...]`.
///
/// REST rows are always treated as closed; the caller only requests
/// ranges that end at or before the last closed bucket.
pub fn decode_rest_row(
    symbol: &str,
    timeframe: Timeframe,
    row: &[Value],
) -> Result<Candle, DecodeError> {
    let candle = Candle {
        symbol: symbol.to_string(),
        timeframe,
        open_time: int_at(row, 0, "open_time")?,
        open: decimal_at(row, 1, "open")?,
        high: decimal_at(row, 2, "high")?,
        low: decimal_at(row, 3, "low")?,
        close: decimal_at(row, 4, "close")?,
        base_volume: decimal_at(row, 5, "volume")?,
        close_time: int_at(row, 6, "close_time")?,
        quote_volume: decimal_at(row, 7, "quote_volume")?,
        trade_count: int_at(row, 8, "trade_count")?,
        taker_buy_base_volume: decimal_at(row, 9, "taker_buy_base")?,
        taker_buy_quote_volume: decimal_at(row, 10, "taker_buy_quote")?,
        is_closed: true,
        event_time: None,
        first_trade_id: None,
        last_trade_id: None,
        open_interest: None,
        funding_rate: None,
    };
    candle.validate()?;
    Ok(candle)
}

/// Open time of a REST row without decoding the rest of it.
pub fn rest_row_open_time(row: &[Value]) -> Option<i64> {
    row.first().and_then(Value::as_i64)
}

fn parse_decimal(field: &'static str, raw: &str) -> Result<Decimal, DecodeError> {
    Decimal::from_str(raw).map_err(|_| DecodeError::number(field, raw))
}

fn int_at(row: &[Value], idx: usize, field: &'static str) -> Result<i64, DecodeError> {
    match row.get(idx) {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| DecodeError::number(field, n)),
        Some(Value::String(s)) => s.parse().map_err(|_| DecodeError::number(field, s)),
        Some(other) => Err(DecodeError::number(field, other)),
        None => Err(DecodeError::Missing(field)),
    }
}

fn decimal_at(row: &[Value], idx: usize, field: &'static str) -> Result<Decimal, DecodeError> {
    match row.get(idx) {
        Some(Value::String(s)) => parse_decimal(field, s),
        Some(Value::Number(n)) => parse_decimal(field, &n.to_string()),
        Some(other) => Err(DecodeError::number(field, other)),
        None => Err(DecodeError::Missing(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn kline_frame(closed: bool) -> Value {
        json!({
            "e": "kline",
            "E": 1770054684442i64,
            "s": "BTCUSDT",
            "k": {
                "t": 1770054660000i64,
                "T": 1770054719999i64,
                "s": "BTCUSDT",
                "i": "1m",
                "f": 7182319799i64,
                "L": 7182322619i64,
                "o": "78828.70",
                "c": "78741.10",
                "h": "78828.80",
                "l": "78741.10",
                "v": "55.289",
                "n": 2820,
                "x": closed,
                "q": "4355601.29060",
                "V": "21.488",
                "Q": "1692722.54870",
                "B": "0"
            }
        })
    }

    #[test]
    fn test_closed_kline_decodes() {
        let text = kline_frame(true).to_string();
        let c = match decode_stream_message(&text).unwrap() {
            StreamEvent::Closed(c) => c,
            other => panic!("expected closed candle, got {:?}", other),
        };
        assert_eq!(c.symbol, "BTCUSDT");
        assert_eq!(c.timeframe, Timeframe::M1);
        assert_eq!(c.open_time, 1770054660000);
        assert_eq!(c.close_time, 1770054719999);
        assert_eq!(c.open, dec!(78828.70));
        assert_eq!(c.low, dec!(78741.10));
        assert_eq!(c.base_volume, dec!(55.289));
        assert_eq!(c.taker_buy_quote_volume, dec!(1692722.54870));
        assert_eq!(c.trade_count, 2820);
        assert_eq!(c.event_time, Some(1770054684442));
        assert_eq!(c.first_trade_id, Some(7182319799));
        assert!(c.is_closed);
    }

    #[test]
    fn test_open_kline_is_not_forwarded() {
        let text = kline_frame(false).to_string();
        assert_eq!(
            decode_stream_message(&text).unwrap(),
            StreamEvent::Open {
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::M1
            }
        );
    }

    #[test]
    fn test_combined_wrapper_is_unwrapped() {
        let text = json!({ "stream": "btcusdt@kline_1m", "data": kline_frame(true) }).to_string();
        assert!(matches!(
            decode_stream_message(&text).unwrap(),
            StreamEvent::Closed(_)
        ));
    }

    #[test]
    fn test_subscription_ack() {
        let event = decode_stream_message(r#"{"result":null,"id":7}"#).unwrap();
        assert_eq!(event, StreamEvent::Ack { id: 7, error: None });
    }

    #[test]
    fn test_malformed_price_is_decode_error() {
        let mut frame = kline_frame(true);
        frame["k"]["o"] = json!("not-a-price");
        let err = decode_stream_message(&frame.to_string()).unwrap_err();
        assert!(matches!(err, DecodeError::Number { field: "o", .. }));
    }

    #[test]
    fn test_unknown_interval_is_decode_error() {
        let mut frame = kline_frame(true);
        frame["k"]["i"] = json!("1M");
        assert!(matches!(
            decode_stream_message(&frame.to_string()),
            Err(DecodeError::Interval(_))
        ));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(matches!(
            decode_stream_message("{not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_rest_row_decodes() {
        let row: RawKline = serde_json::from_value(json!([
            1_700_000_000_000i64, "100.0", "101.5", "99.5", "100.25", "12.5",
            1_700_000_059_999i64, "1250.0", 42, "6.0", "600.0", "0"
        ]))
        .unwrap();

        let c = decode_rest_row("ETHUSDT", Timeframe::M1, &row).unwrap();
        assert_eq!(c.open_time, 1_700_000_000_000);
        assert_eq!(c.close_time, 1_700_000_059_999);
        assert_eq!(c.high, dec!(101.5));
        assert_eq!(c.quote_volume, dec!(1250.0));
        assert_eq!(c.trade_count, 42);
        assert_eq!(c.event_time, None);
        assert_eq!(rest_row_open_time(&row), Some(1_700_000_000_000));
    }

    #[test]
    fn test_short_rest_row_is_missing_field() {
        let row: RawKline = serde_json::from_value(json!([1, "1", "1", "1", "1"])).unwrap();
        assert!(matches!(
            decode_rest_row("ETHUSDT", Timeframe::M1, &row),
            Err(DecodeError::Missing("volume"))
        ));
    }
}
